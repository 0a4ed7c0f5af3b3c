//! Fixed catalog of schedulable task names. Each resolves to a canonical
//! description that is fed to the assistant verbatim.

pub const CATALOG: &[(&str, &str)] = &[
    ("clean_code", "Clean and format code files"),
    ("run_tests", "Run project test suite"),
    ("code_review", "Perform automated code review"),
    ("update_deps", "Check and update dependencies"),
    ("security_scan", "Run security vulnerability scan"),
    ("performance_check", "Analyze performance metrics"),
    ("documentation_update", "Update README and documentation"),
];

pub fn description(name: &str) -> Option<&'static str> {
    CATALOG
        .iter()
        .find(|(task, _)| *task == name)
        .map(|(_, description)| *description)
}

pub fn names() -> impl Iterator<Item = &'static str> {
    CATALOG.iter().map(|(name, _)| *name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_catalog_name_resolves() {
        for name in names() {
            assert!(description(name).is_some());
        }
        assert_eq!(description("run_tests"), Some("Run project test suite"));
        assert_eq!(description("made_up"), None);
    }
}
