use regex::Regex;
use thiserror::Error;

use crate::domain::Repository;

/// Selects repositories whose name matches a regular expression.
///
/// The pattern is searched for anywhere in the raw repository name, so a
/// trailing `.git` is part of the matched text.
#[derive(Clone, Debug)]
pub struct RepositoryFilter {
    pattern: Regex,
}

impl RepositoryFilter {
    pub fn new(pattern: &str) -> Result<Self, FilterError> {
        let pattern = Regex::new(pattern).map_err(|source| FilterError::InvalidPattern {
            pattern: pattern.to_owned(),
            source,
        })?;
        Ok(Self { pattern })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn includes(&self, repository: &Repository) -> bool {
        self.includes_name(&repository.name)
    }

    pub fn includes_name(&self, name: &str) -> bool {
        self.pattern.is_match(name)
    }
}

/// `None` means no filtering.
pub fn includes(filter: Option<&RepositoryFilter>, repository: &Repository) -> bool {
    filter.is_none_or(|filter| filter.includes(repository))
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Repository name pattern `{pattern}` is not a valid regular expression: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    const CASES: &[(&str, &str, bool)] = &[
        (".*", "repo-name", true),
        (".*", "literally anything", true),
        ("repo-naim", "repo-name", false),
        ("repo-$", "repo-name", false),
        ("repo-.*", "repo-name", true),
        ("(app1|app2)-.*", "app1-repo1", true),
        ("(app1|app2)-.*", "app2-repo1", true),
        ("(app1|app2)-.*", "app3-repo1", false),
        ("app-[^d].*", "app-docs", false),
        ("app-[^d].*", "app-loggingService", true),
        ("app-[^d].*", "app-persistenceService", true),
    ];

    fn repository(name: &str) -> Repository {
        Repository {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            project_name: "Widgets".into(),
        }
    }

    #[test]
    fn includes_matches_names_without_git_suffix() {
        for (pattern, name, expected) in CASES {
            let filter = RepositoryFilter::new(pattern).expect("valid pattern");
            assert_eq!(
                filter.includes(&repository(name)),
                *expected,
                "{pattern} against {name}"
            );
        }
    }

    #[test]
    fn includes_matches_names_with_git_suffix() {
        for (pattern, name, expected) in CASES {
            let filter = RepositoryFilter::new(pattern).expect("valid pattern");
            let name = format!("{name}.git");
            assert_eq!(
                filter.includes(&repository(&name)),
                *expected,
                "{pattern} against {name}"
            );
        }
    }

    #[test]
    fn pattern_is_searched_not_anchored() {
        let filter = RepositoryFilter::new("repo-").expect("valid pattern");
        assert!(filter.includes_name("my-repo-name"));
    }

    #[test]
    fn missing_filter_includes_everything() {
        assert!(includes(None, &repository("docs")));
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let err = RepositoryFilter::new("(unclosed").unwrap_err();
        assert!(matches!(err, FilterError::InvalidPattern { ref pattern, .. } if pattern == "(unclosed"));
    }
}
