//! OCI distribution scope strings: `repository:<repo>:<push|pull|*>` and the
//! administrative `admin:*:*` used for lifecycle endpoints.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Pull,
    Push,
    Wildcard,
}

impl Action {
    fn allows(self, requested: Action) -> bool {
        self == Action::Wildcard || self == requested
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Pull => "pull",
            Action::Push => "push",
            Action::Wildcard => "*",
        })
    }
}

/// A single granted scope, e.g. `repository:library/alpine:pull` or `admin:*:*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Repository { repository: String, action: Action },
    Admin,
}

impl Scope {
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, ':');
        let resource = parts.next()?;
        let name = parts.next()?;
        let action = parts.next()?;

        match resource {
            "admin" if name == "*" && action == "*" => Some(Scope::Admin),
            "repository" => {
                let action = match action {
                    "pull" => Action::Pull,
                    "push" => Action::Push,
                    "*" => Action::Wildcard,
                    _ => return None,
                };
                Some(Scope::Repository {
                    repository: name.to_string(),
                    action,
                })
            }
            _ => None,
        }
    }

    pub fn admin() -> Self {
        Scope::Admin
    }

    pub fn repository(repository: impl Into<String>, action: Action) -> Self {
        Scope::Repository {
            repository: repository.into(),
            action,
        }
    }

    /// Whether this granted scope satisfies a request for `action` on `repo`.
    /// `admin:*:*` satisfies every request; a repository scope only ever
    /// satisfies requests against the same repository.
    pub fn satisfies(&self, repo: &str, action: Action) -> bool {
        match self {
            Scope::Admin => true,
            Scope::Repository {
                repository,
                action: granted,
            } => repository == repo && granted.allows(action),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Admin => write!(f, "admin:*:*"),
            Scope::Repository { repository, action } => {
                write!(f, "repository:{repository}:{action}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repository_and_admin_scopes() {
        assert_eq!(
            Scope::parse("repository:library/alpine:push"),
            Some(Scope::repository("library/alpine", Action::Push))
        );
        assert_eq!(Scope::parse("admin:*:*"), Some(Scope::Admin));
        assert_eq!(Scope::parse("garbage"), None);
    }

    #[test]
    fn wildcard_action_satisfies_any_request() {
        let scope = Scope::repository("app", Action::Wildcard);
        assert!(scope.satisfies("app", Action::Push));
        assert!(scope.satisfies("app", Action::Pull));
        assert!(!scope.satisfies("other", Action::Pull));
    }

    #[test]
    fn admin_scope_satisfies_everything() {
        assert!(Scope::Admin.satisfies("anything", Action::Push));
    }

    #[test]
    fn push_scope_does_not_satisfy_pull_request() {
        let scope = Scope::repository("app", Action::Push);
        assert!(!scope.satisfies("app", Action::Pull));
    }
}
