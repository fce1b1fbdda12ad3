use std::collections::BTreeSet;

/// Allow-list of users permitted to run management commands.
#[derive(Debug, Clone, Default)]
pub struct AdminPolicy {
    admins: BTreeSet<String>,
}

impl AdminPolicy {
    pub fn new<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let admins = admins
            .into_iter()
            .map(|a| a.as_ref().trim().to_owned())
            .filter(|a| !a.is_empty())
            .collect();
        Self { admins }
    }

    #[must_use]
    pub fn is_admin(&self, user: &str) -> bool {
        self.admins.contains(user)
    }

    pub fn admins(&self) -> impl Iterator<Item = &str> {
        self.admins.iter().map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.admins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_is_exact() {
        let policy = AdminPolicy::new(["@alice:example.org", " @bob:example.org ", ""]);
        assert!(policy.is_admin("@alice:example.org"));
        assert!(policy.is_admin("@bob:example.org"));
        assert!(!policy.is_admin("@Alice:example.org"));
        assert!(!policy.is_admin(""));
        assert_eq!(policy.admins().count(), 2);
    }

    #[test]
    fn empty_list_admits_nobody() {
        let policy = AdminPolicy::default();
        assert!(policy.is_empty());
        assert!(!policy.is_admin("@alice:example.org"));
    }
}
