//! Matrix expansion for parallel job generation.
//!
//! Expansion rule, fixed deterministically because real-world tools
//! disagree on the edge cases: the Cartesian product of the axes is built
//! in declaration order, `exclude` entries are applied to the product
//! first, then `include` entries are applied in order. An include entry
//! whose axis-named keys match an existing combination merges its
//! remaining keys onto every matching combination (add-on); an entry that
//! matches no combination, or names no axis keys at all, is appended as a
//! wholly new standalone combination.

use gantry_core::workflow::MatrixSpec;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MatrixSpecError {
    #[error("matrix axis '{0}' has no values")]
    EmptyAxis(String),

    #[error("non-scalar value for '{key}' in matrix {section}")]
    NonScalarValue { section: String, key: String },
}

/// One concrete matrix assignment: key/value pairs in a deterministic
/// order (axis declaration order, include add-ons appended).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Combination {
    pairs: Vec<(String, Value)>,
}

impl Combination {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    fn set(&mut self, key: &str, value: Value) {
        match self.pairs.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.pairs.push((key.to_string(), value)),
        }
    }

    /// True when every key in `entry` is present here with an equal value.
    fn superset_matches(&self, entry: &BTreeMap<String, Value>) -> bool {
        entry.iter().all(|(k, v)| self.get(k) == Some(v))
    }

    pub fn into_map(self) -> BTreeMap<String, Value> {
        self.pairs.into_iter().collect()
    }

    /// Deterministic display suffix, e.g. `os=linux, version=18`.
    pub fn label(&self) -> String {
        let parts: Vec<String> = self
            .pairs
            .iter()
            .map(|(k, v)| {
                let v_str = match v {
                    Value::String(s) => s.clone(),
                    _ => v.to_string(),
                };
                format!("{}={}", k, v_str)
            })
            .collect();
        parts.join(", ")
    }
}

/// Expander for matrix configurations.
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    /// Expand a matrix configuration into concrete combinations.
    ///
    /// An empty axis list yields a single empty combination: the job is
    /// not matrixed and collapses to one instance.
    pub fn expand(&self, spec: &MatrixSpec) -> Result<Vec<Combination>, MatrixSpecError> {
        self.validate(spec)?;

        let mut combinations = self.generate_combinations(spec);

        // Excludes first, against the raw product only.
        combinations.retain(|combo| {
            !spec
                .exclude
                .iter()
                .any(|entry| !entry.is_empty() && combo.superset_matches(entry))
        });

        // Includes second: add-on where the axis keys line up, standalone
        // combination otherwise.
        let axis_names: Vec<&str> = spec.axes.iter().map(|a| a.name.as_str()).collect();
        for entry in &spec.include {
            if entry.is_empty() {
                continue;
            }
            let axis_part: BTreeMap<String, Value> = entry
                .iter()
                .filter(|(k, _)| axis_names.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            let mut merged_any = false;
            if !axis_part.is_empty() {
                for combo in combinations
                    .iter_mut()
                    .filter(|c| c.superset_matches(&axis_part))
                {
                    for (k, v) in entry {
                        combo.set(k, v.clone());
                    }
                    merged_any = true;
                }
            }

            if !merged_any {
                let mut combo = Combination::default();
                for (k, v) in entry {
                    combo.set(k, v.clone());
                }
                // Repeated include entries collapse to one combination;
                // duplicates would break instance-id uniqueness downstream.
                if !combinations.contains(&combo) {
                    combinations.push(combo);
                }
            }
        }

        Ok(combinations)
    }

    fn validate(&self, spec: &MatrixSpec) -> Result<(), MatrixSpecError> {
        for axis in &spec.axes {
            if axis.values.is_empty() {
                return Err(MatrixSpecError::EmptyAxis(axis.name.clone()));
            }
            if axis.values.iter().any(|v| v.is_array() || v.is_object()) {
                return Err(MatrixSpecError::NonScalarValue {
                    section: "axes".to_string(),
                    key: axis.name.clone(),
                });
            }
        }
        for (section, entries) in [("include", &spec.include), ("exclude", &spec.exclude)] {
            for entry in entries {
                for (key, value) in entry {
                    if value.is_array() || value.is_object() {
                        return Err(MatrixSpecError::NonScalarValue {
                            section: section.to_string(),
                            key: key.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn generate_combinations(&self, spec: &MatrixSpec) -> Vec<Combination> {
        let mut result = vec![Combination::default()];

        for axis in &spec.axes {
            let mut expanded = Vec::with_capacity(result.len() * axis.values.len());
            for combo in &result {
                for value in &axis.values {
                    let mut next = combo.clone();
                    next.set(&axis.name, value.clone());
                    expanded.push(next);
                }
            }
            result = expanded;
        }

        result
    }
}

impl Default for MatrixExpander {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::workflow::MatrixAxis;
    use serde_json::json;

    fn spec(axes: Vec<MatrixAxis>) -> MatrixSpec {
        MatrixSpec {
            axes,
            include: vec![],
            exclude: vec![],
        }
    }

    fn entry(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_cartesian_product_in_declaration_order() {
        let spec = spec(vec![
            MatrixAxis::new("os", vec![json!("linux"), json!("macos")]),
            MatrixAxis::new("version", vec![json!(18), json!(20), json!(22)]),
        ]);

        let combos = MatrixExpander::new().expand(&spec).unwrap();
        assert_eq!(combos.len(), 6);
        // First axis varies slowest; labels are deterministic.
        assert_eq!(combos[0].label(), "os=linux, version=18");
        assert_eq!(combos[1].label(), "os=linux, version=20");
        assert_eq!(combos[5].label(), "os=macos, version=22");
    }

    #[test]
    fn test_empty_axes_single_instance() {
        let combos = MatrixExpander::new().expand(&spec(vec![])).unwrap();
        assert_eq!(combos.len(), 1);
        assert!(combos[0].is_empty());
    }

    #[test]
    fn test_exclude_removes_superset_match() {
        let mut spec = spec(vec![
            MatrixAxis::new("os", vec![json!("linux"), json!("macos")]),
            MatrixAxis::new("arch", vec![json!("amd64"), json!("arm64")]),
        ]);
        spec.exclude = vec![entry(&[("os", json!("macos")), ("arch", json!("amd64"))])];

        let combos = MatrixExpander::new().expand(&spec).unwrap();
        assert_eq!(combos.len(), 3);
        assert!(
            combos
                .iter()
                .all(|c| c.label() != "os=macos, arch=amd64")
        );
    }

    #[test]
    fn test_include_add_on_merges_extra_keys() {
        let mut spec = spec(vec![MatrixAxis::new(
            "os",
            vec![json!("linux"), json!("macos")],
        )]);
        spec.include = vec![entry(&[("os", json!("linux")), ("cache", json!(true))])];

        let combos = MatrixExpander::new().expand(&spec).unwrap();
        assert_eq!(combos.len(), 2);
        let linux = combos.iter().find(|c| c.get("os") == Some(&json!("linux"))).unwrap();
        assert_eq!(linux.get("cache"), Some(&json!(true)));
        let macos = combos.iter().find(|c| c.get("os") == Some(&json!("macos"))).unwrap();
        assert_eq!(macos.get("cache"), None);
    }

    #[test]
    fn test_include_new_keys_appends_standalone() {
        let mut spec = spec(vec![MatrixAxis::new("os", vec![json!("linux")])]);
        spec.include = vec![entry(&[("experimental", json!("nightly"))])];

        let combos = MatrixExpander::new().expand(&spec).unwrap();
        assert_eq!(combos.len(), 2);
        assert_eq!(combos[1].get("experimental"), Some(&json!("nightly")));
        assert_eq!(combos[1].get("os"), None);
    }

    #[test]
    fn test_repeated_standalone_include_collapses() {
        let mut spec = spec(vec![MatrixAxis::new("os", vec![json!("linux")])]);
        spec.include = vec![
            entry(&[("experimental", json!(true))]),
            entry(&[("experimental", json!(true))]),
        ];

        let combos = MatrixExpander::new().expand(&spec).unwrap();
        assert_eq!(combos.len(), 2);
        assert_eq!(combos[1].get("experimental"), Some(&json!(true)));
    }

    #[test]
    fn test_include_unmatched_axis_value_appends_standalone() {
        // Axis key present but no product member matches it: standalone.
        let mut spec = spec(vec![MatrixAxis::new("os", vec![json!("linux")])]);
        spec.include = vec![entry(&[("os", json!("windows")), ("shell", json!("pwsh"))])];

        let combos = MatrixExpander::new().expand(&spec).unwrap();
        assert_eq!(combos.len(), 2);
        assert_eq!(combos[1].get("os"), Some(&json!("windows")));
        assert_eq!(combos[1].get("shell"), Some(&json!("pwsh")));
    }

    #[test]
    fn test_exclude_applies_before_include() {
        // The excluded member is gone before includes run, so an include
        // matching it re-adds a standalone combination rather than merging.
        let mut spec = spec(vec![MatrixAxis::new(
            "os",
            vec![json!("linux"), json!("macos")],
        )]);
        spec.exclude = vec![entry(&[("os", json!("macos"))])];
        spec.include = vec![entry(&[("os", json!("macos")), ("cache", json!(false))])];

        let combos = MatrixExpander::new().expand(&spec).unwrap();
        assert_eq!(combos.len(), 2);
        assert_eq!(combos[1].get("os"), Some(&json!("macos")));
        assert_eq!(combos[1].get("cache"), Some(&json!(false)));
    }

    #[test]
    fn test_non_scalar_axis_value_rejected() {
        let spec = spec(vec![MatrixAxis::new("os", vec![json!(["linux"])])]);
        let err = MatrixExpander::new().expand(&spec).unwrap_err();
        assert!(matches!(err, MatrixSpecError::NonScalarValue { .. }));
    }

    #[test]
    fn test_empty_axis_rejected() {
        let spec = spec(vec![MatrixAxis::new("os", vec![])]);
        let err = MatrixExpander::new().expand(&spec).unwrap_err();
        assert!(matches!(err, MatrixSpecError::EmptyAxis(name) if name == "os"));
    }

    #[test]
    fn test_product_members_unique() {
        let spec = spec(vec![
            MatrixAxis::new("a", vec![json!(1), json!(2)]),
            MatrixAxis::new("b", vec![json!("x"), json!("y"), json!("z")]),
        ]);
        let combos = MatrixExpander::new().expand(&spec).unwrap();
        assert_eq!(combos.len(), 6);
        for i in 0..combos.len() {
            for j in (i + 1)..combos.len() {
                assert_ne!(combos[i], combos[j]);
            }
        }
    }
}
