//! Iteration-to-target naming.
//!
//! File-based series write one backend target per iteration, named by
//! substituting the iteration index into a template (`%T`, or `%0<N>T` for a
//! zero-padded index). Group-based series write every iteration into one
//! target as `/data/<index>` groups.

use serde::{Deserialize, Serialize};

use crate::backend::BackendTarget;
use crate::error::{StepfluxError, StepfluxResult};

/// How iterations map to backend targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationEncoding {
    /// One target per iteration
    FileBased,
    /// One target for the whole run
    GroupBased,
}

impl IterationEncoding {
    /// Value of the `iterationEncoding` series attribute.
    pub fn attribute_value(&self) -> &'static str {
        match self {
            IterationEncoding::FileBased => "fileBased",
            IterationEncoding::GroupBased => "groupBased",
        }
    }
}

/// Location of the iteration placeholder inside a template.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Placeholder {
    prefix: String,
    suffix: String,
    width: usize,
}

/// Resolves iteration indices to backend targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingPolicy {
    path: String,
    placeholder: Option<Placeholder>,
}

impl NamingPolicy {
    /// Parses `path`; a placeholder selects file-based encoding.
    pub fn from_path(path: &str) -> StepfluxResult<Self> {
        let placeholder = parse_placeholder(path)?;
        Ok(Self {
            path: path.to_string(),
            placeholder,
        })
    }

    /// Encoding selected by the path.
    pub fn encoding(&self) -> IterationEncoding {
        if self.placeholder.is_some() {
            IterationEncoding::FileBased
        } else {
            IterationEncoding::GroupBased
        }
    }

    /// The path or template as given.
    pub fn template(&self) -> &str {
        &self.path
    }

    /// Value of the `iterationFormat` series attribute.
    pub fn iteration_format(&self) -> String {
        match self.encoding() {
            IterationEncoding::FileBased => self.path.clone(),
            IterationEncoding::GroupBased => "/data/%T/".to_string(),
        }
    }

    /// Target that holds iteration `index`.
    pub fn resolve(&self, index: u64) -> BackendTarget {
        match &self.placeholder {
            Some(p) => BackendTarget::new(format!(
                "{}{:0width$}{}",
                p.prefix,
                index,
                p.suffix,
                width = p.width
            )),
            None => BackendTarget::new(self.path.clone()),
        }
    }
}

fn parse_placeholder(path: &str) -> StepfluxResult<Option<Placeholder>> {
    let invalid = |reason: &str| StepfluxError::InvalidTemplate {
        template: path.to_string(),
        reason: reason.to_string(),
    };

    let mut found: Option<Placeholder> = None;
    let bytes = path.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            i += 1;
            continue;
        }
        let mut j = i + 1;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if j < bytes.len() && bytes[j] == b'T' {
            if found.is_some() {
                return Err(invalid("more than one iteration placeholder"));
            }
            let digits = &path[i + 1..j];
            if !digits.is_empty() && !digits.starts_with('0') {
                return Err(invalid("padding width must start with 0"));
            }
            let width = if digits.is_empty() {
                0
            } else {
                digits.parse::<usize>().map_err(|_| invalid("bad padding width"))?
            };
            found = Some(Placeholder {
                prefix: path[..i].to_string(),
                suffix: path[j + 1..].to_string(),
                width,
            });
            i = j + 1;
        } else {
            i = j.max(i + 1);
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_based_path() {
        let p = NamingPolicy::from_path("samples/8a_parallel_1Db.json").unwrap();
        assert_eq!(p.encoding(), IterationEncoding::GroupBased);
        assert_eq!(p.resolve(1).as_str(), "samples/8a_parallel_1Db.json");
        assert_eq!(p.resolve(9).as_str(), "samples/8a_parallel_1Db.json");
        assert_eq!(p.iteration_format(), "/data/%T/");
    }

    #[test]
    fn test_file_based_unpadded() {
        let p = NamingPolicy::from_path("out_%T.json").unwrap();
        assert_eq!(p.encoding(), IterationEncoding::FileBased);
        assert_eq!(p.resolve(42).as_str(), "out_42.json");
    }

    #[test]
    fn test_file_based_padded() {
        let p = NamingPolicy::from_path("samples/8a_parallel_2Du_%07T.json").unwrap();
        assert_eq!(p.resolve(3).as_str(), "samples/8a_parallel_2Du_0000003.json");
        assert_eq!(p.iteration_format(), "samples/8a_parallel_2Du_%07T.json");
    }

    #[test]
    fn test_wide_index_not_truncated() {
        let p = NamingPolicy::from_path("f_%03T").unwrap();
        assert_eq!(p.resolve(12345).as_str(), "f_12345");
    }

    #[test]
    fn test_double_placeholder_rejected() {
        assert!(matches!(
            NamingPolicy::from_path("a_%T_%T.json"),
            Err(StepfluxError::InvalidTemplate { .. })
        ));
    }

    #[test]
    fn test_unpadded_width_rejected() {
        assert!(NamingPolicy::from_path("a_%7T.json").is_err());
    }

    #[test]
    fn test_other_percent_sequences_ignored() {
        let p = NamingPolicy::from_path("100%_done.json").unwrap();
        assert_eq!(p.encoding(), IterationEncoding::GroupBased);
    }

    #[test]
    fn test_encoding_attribute_values() {
        assert_eq!(IterationEncoding::FileBased.attribute_value(), "fileBased");
        assert_eq!(IterationEncoding::GroupBased.attribute_value(), "groupBased");
    }
}
