//! Test plan documents.
//!
//! A plan is a YAML document kept in the tests repository:
//!
//! ```yaml
//! tests:
//!   Firefox-Example-Basic:
//!     entrypoint: tests/firefox-example/basic
//!     requirements:
//!       tpm: false
//! ```
//!
//! Test cases keep their document order, which is also the order test rows
//! are created in.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("failed to read plan {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse plan: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("plan {0} declares no tests")]
    Empty(String),
    #[error("plan path {0:?} escapes the repository")]
    OutsideRepository(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub tpm: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TestCaseSpec {
    pub entrypoint: String,
    #[serde(default)]
    pub requirements: Requirements,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub name: String,
    pub spec: TestCaseSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TestPlan {
    #[serde(deserialize_with = "ordered_cases")]
    pub tests: Vec<TestCase>,
}

impl TestPlan {
    pub fn from_yaml(source: &str) -> Result<Self, PlanError> {
        Ok(serde_yaml::from_str(source)?)
    }

    /// Read and parse `plan` relative to a checked-out repository.
    ///
    /// Rejects plans without test cases.
    pub async fn load(repo_dir: &Path, plan: &str) -> Result<Self, PlanError> {
        let path = resolve(repo_dir, plan)?;
        let source = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| PlanError::Read {
                path: path.clone(),
                source,
            })?;
        let parsed = Self::from_yaml(&source)?;
        if parsed.tests.is_empty() {
            return Err(PlanError::Empty(plan.to_string()));
        }
        Ok(parsed)
    }

    pub fn entrypoint_for(&self, test_case: &str) -> Option<&str> {
        self.tests
            .iter()
            .find(|case| case.name == test_case)
            .map(|case| case.spec.entrypoint.as_str())
            .filter(|entrypoint| !entrypoint.is_empty())
    }
}

fn resolve(repo_dir: &Path, plan: &str) -> Result<PathBuf, PlanError> {
    let relative = Path::new(plan);
    let escapes = relative.is_absolute()
        || relative
            .components()
            .any(|component| matches!(component, std::path::Component::ParentDir));
    if escapes {
        return Err(PlanError::OutsideRepository(plan.to_string()));
    }
    Ok(repo_dir.join(relative))
}

fn ordered_cases<'de, D>(deserializer: D) -> Result<Vec<TestCase>, D::Error>
where
    D: Deserializer<'de>,
{
    struct CasesVisitor;

    impl<'de> Visitor<'de> for CasesVisitor {
        type Value = Vec<TestCase>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a mapping of test case name to test case")
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut cases: Vec<TestCase> = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((name, spec)) = map.next_entry::<String, TestCaseSpec>()? {
                if cases.iter().any(|case| case.name == name) {
                    return Err(de::Error::custom(format!("duplicate test case {name:?}")));
                }
                cases.push(TestCase { name, spec });
            }
            Ok(cases)
        }
    }

    deserializer.deserialize_any(CasesVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
tests:
  Firefox-Example-New-Tab:
    entrypoint: tests/firefox-example/new-tab
  Firefox-Example-Basic:
    entrypoint: tests/firefox-example/basic
    requirements:
      tpm: true
"#;

    #[test]
    fn keeps_document_order_and_requirements() {
        let plan = TestPlan::from_yaml(PLAN).expect("parse plan");
        let names: Vec<&str> = plan.tests.iter().map(|case| case.name.as_str()).collect();
        assert_eq!(names, vec!["Firefox-Example-New-Tab", "Firefox-Example-Basic"]);
        assert!(!plan.tests[0].spec.requirements.tpm);
        assert!(plan.tests[1].spec.requirements.tpm);
    }

    #[test]
    fn entrypoint_lookup() {
        let plan = TestPlan::from_yaml(PLAN).expect("parse plan");
        assert_eq!(
            plan.entrypoint_for("Firefox-Example-Basic"),
            Some("tests/firefox-example/basic")
        );
        assert_eq!(plan.entrypoint_for("Missing"), None);
    }

    #[test]
    fn duplicate_case_names_are_rejected() {
        let source = r#"
tests:
  Basic:
    entrypoint: a
  Basic:
    entrypoint: b
"#;
        assert!(TestPlan::from_yaml(source).is_err());
    }

    #[test]
    fn tests_must_be_a_mapping() {
        assert!(TestPlan::from_yaml("tests:\n  - Basic\n").is_err());
        assert!(TestPlan::from_yaml("other: 1\n").is_err());
    }

    #[tokio::test]
    async fn load_reads_relative_to_repo_and_rejects_empty_plans() {
        let repo = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(repo.path().join("plans")).expect("mkdir");
        std::fs::write(repo.path().join("plans/regular.yaml"), PLAN).expect("write plan");
        std::fs::write(repo.path().join("plans/empty.yaml"), "tests:\n").expect("write plan");

        let plan = TestPlan::load(repo.path(), "plans/regular.yaml")
            .await
            .expect("load plan");
        assert_eq!(plan.tests.len(), 2);

        let empty = TestPlan::load(repo.path(), "plans/empty.yaml").await;
        assert!(matches!(empty, Err(PlanError::Empty(_))));

        let missing = TestPlan::load(repo.path(), "plans/missing.yaml").await;
        assert!(matches!(missing, Err(PlanError::Read { .. })));

        let escaping = TestPlan::load(repo.path(), "../etc/passwd").await;
        assert!(matches!(escaping, Err(PlanError::OutsideRepository(_))));
    }
}
