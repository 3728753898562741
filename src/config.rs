use owo_colors::OwoColorize;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The product's own name is not a valid service name.
pub const RESERVED_NAME: &str = "pmo";

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// Normalized declaration of one service, valid for the duration of a
/// command.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    pub name: String,
    /// Run via `/bin/sh -c`, so pipelines, redirects, heredocs, and line
    /// continuations survive untouched.
    pub cmd: String,
    /// Already resolved against the descriptor's directory.
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

/// The two accepted descriptor forms for a service entry.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ServiceValue {
    Shorthand(String),
    Full(RawServiceSpec),
}

#[derive(Debug, Deserialize)]
struct RawServiceSpec {
    cmd: Option<String>,
    /// Legacy alias for `cmd`; `cmd` wins when both are present.
    script: Option<String>,
    cwd: Option<String>,
    env: Option<HashMap<String, String>>,
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("YAML parse error: {0}")]
    YamlParse(String),
    #[error("descriptor root must be a mapping of service names")]
    NotAMapping,
}

// ---------------------------------------------------------------------------
// Loading and normalization
// ---------------------------------------------------------------------------

pub fn load_descriptor(path: &Path) -> Result<Vec<ServiceSpec>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let base_dir = path.parent().unwrap_or(Path::new("."));
    parse_descriptor(&content, base_dir)
}

/// Normalize the raw descriptor into service specs, preserving document
/// order. Invalid entries and the reserved name are dropped with a warning;
/// only a non-mapping root or unparseable YAML fails the whole descriptor.
pub fn parse_descriptor(content: &str, base_dir: &Path) -> Result<Vec<ServiceSpec>, ConfigError> {
    let root: serde_yaml::Value =
        serde_yaml::from_str(content).map_err(|e| ConfigError::YamlParse(e.to_string()))?;

    if root.is_null() {
        return Ok(Vec::new());
    }
    let mapping = root.as_mapping().ok_or(ConfigError::NotAMapping)?;

    let mut specs = Vec::new();
    for (key, value) in mapping {
        let Some(name) = key.as_str() else {
            warn(&format!("ignoring non-string service name: {key:?}"));
            continue;
        };
        if name.eq_ignore_ascii_case(RESERVED_NAME) {
            warn(&format!(
                "'{RESERVED_NAME}' is a reserved name and cannot be used as a service name"
            ));
            continue;
        }

        match ServiceValue::deserialize(value.clone()) {
            Ok(ServiceValue::Shorthand(cmd)) if !cmd.trim().is_empty() => {
                specs.push(ServiceSpec {
                    name: name.to_string(),
                    cmd,
                    cwd: None,
                    env: HashMap::new(),
                });
            }
            Ok(ServiceValue::Full(raw)) => {
                let Some(cmd) = raw.cmd.or(raw.script) else {
                    warn(&format!("no command specified for service '{name}', skipping"));
                    continue;
                };
                specs.push(ServiceSpec {
                    name: name.to_string(),
                    cmd,
                    cwd: raw.cwd.map(|c| resolve_cwd(&c, base_dir)),
                    env: raw.env.unwrap_or_default(),
                });
            }
            _ => {
                warn(&format!("invalid configuration for service '{name}', skipping"));
            }
        }
    }
    Ok(specs)
}

fn resolve_cwd(cwd: &str, base_dir: &Path) -> PathBuf {
    let path = Path::new(cwd);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn warn(message: &str) {
    eprintln!("{} {message}", "warning:".yellow().bold());
}

// ---------------------------------------------------------------------------
// Environment merge
// ---------------------------------------------------------------------------

/// Effective environment for a spawn: parent process environment, then the
/// dotenv layer, then the spec's own `env`. Later wins per key.
pub fn effective_env(
    spec: &ServiceSpec,
    dotenv: &[(String, String)],
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    for (key, value) in dotenv {
        env.insert(key.clone(), value.clone());
    }
    for (key, value) in &spec.env {
        env.insert(key.clone(), value.clone());
    }
    env
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Resolve selector arguments (service names, 1-based numeric ids, or the
/// keyword `all`) against the descriptor order. Returns the matched specs
/// (de-duplicated, first occurrence wins) and the selectors that matched
/// nothing.
pub fn resolve_selection<'a>(
    specs: &'a [ServiceSpec],
    selectors: &[String],
) -> (Vec<&'a ServiceSpec>, Vec<String>) {
    if selectors.iter().any(|s| s == "all") {
        return (specs.iter().collect(), Vec::new());
    }

    let mut picked: Vec<&ServiceSpec> = Vec::new();
    let mut unknown = Vec::new();
    for selector in selectors {
        let found = match selector.parse::<usize>() {
            Ok(id) if (1..=specs.len()).contains(&id) => Some(&specs[id - 1]),
            Ok(_) => None,
            Err(_) => specs.iter().find(|s| s.name == *selector),
        };
        match found {
            Some(spec) => {
                if !picked.iter().any(|p| p.name == spec.name) {
                    picked.push(spec);
                }
            }
            None => unknown.push(selector.clone()),
        }
    }
    (picked, unknown)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shorthand_form() {
        let specs = parse_descriptor("web: sleep 60\n", Path::new("/base")).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "web");
        assert_eq!(specs[0].cmd, "sleep 60");
        assert!(specs[0].cwd.is_none());
        assert!(specs[0].env.is_empty());
    }

    #[test]
    fn test_detailed_form() {
        let input = r#"
api:
  cmd: cargo run
  cwd: backend
  env:
    PORT: "3000"
"#;
        let specs = parse_descriptor(input, Path::new("/base")).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].cmd, "cargo run");
        assert_eq!(specs[0].cwd.as_deref(), Some(Path::new("/base/backend")));
        assert_eq!(specs[0].env.get("PORT").unwrap(), "3000");
    }

    #[test]
    fn test_script_alias() {
        let input = "worker:\n  script: python worker.py\n";
        let specs = parse_descriptor(input, Path::new("/base")).unwrap();
        assert_eq!(specs[0].cmd, "python worker.py");
    }

    #[test]
    fn test_cmd_wins_over_script() {
        let input = "worker:\n  cmd: new-cmd\n  script: old-cmd\n";
        let specs = parse_descriptor(input, Path::new("/base")).unwrap();
        assert_eq!(specs[0].cmd, "new-cmd");
    }

    #[test]
    fn test_reserved_name_dropped() {
        let input = "pmo: echo hi\nweb: sleep 10\n";
        let specs = parse_descriptor(input, Path::new("/base")).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "web");
    }

    #[test]
    fn test_reserved_name_case_insensitive() {
        let specs = parse_descriptor("PMO: echo hi\n", Path::new("/base")).unwrap();
        assert!(specs.is_empty());
    }

    #[test]
    fn test_invalid_entry_dropped() {
        let input = "bad: 42\ngood: sleep 1\n";
        let specs = parse_descriptor(input, Path::new("/base")).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "good");
    }

    #[test]
    fn test_mapping_without_command_dropped() {
        let input = "bad:\n  cwd: /tmp\n";
        let specs = parse_descriptor(input, Path::new("/base")).unwrap();
        assert!(specs.is_empty());
    }

    #[test]
    fn test_empty_shorthand_dropped() {
        let specs = parse_descriptor("bad: \"\"\n", Path::new("/base")).unwrap();
        assert!(specs.is_empty());
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let input = "svc:\n  cmd: sleep 1\n  bogus: true\n  extra: [1, 2]\n";
        let specs = parse_descriptor(input, Path::new("/base")).unwrap();
        assert_eq!(specs.len(), 1);
    }

    #[test]
    fn test_document_order_preserved() {
        let input = "c: sleep 1\na: sleep 2\nb: sleep 3\n";
        let specs = parse_descriptor(input, Path::new("/base")).unwrap();
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_non_mapping_root_errors() {
        let result = parse_descriptor("- just\n- a list\n", Path::new("/base"));
        assert!(matches!(result.unwrap_err(), ConfigError::NotAMapping));
    }

    #[test]
    fn test_empty_document_is_empty_set() {
        let specs = parse_descriptor("", Path::new("/base")).unwrap();
        assert!(specs.is_empty());
    }

    #[test]
    fn test_malformed_yaml_errors() {
        let result = parse_descriptor("web: [unclosed\n", Path::new("/base"));
        assert!(matches!(result.unwrap_err(), ConfigError::YamlParse(_)));
    }

    #[test]
    fn test_missing_descriptor_errors() {
        let result = load_descriptor(Path::new("/nonexistent/pmo.yml"));
        assert!(matches!(result.unwrap_err(), ConfigError::Io { .. }));
    }

    #[test]
    fn test_absolute_cwd_untouched() {
        let input = "svc:\n  cmd: sleep 1\n  cwd: /opt/app\n";
        let specs = parse_descriptor(input, Path::new("/base")).unwrap();
        assert_eq!(specs[0].cwd.as_deref(), Some(Path::new("/opt/app")));
    }

    #[test]
    fn test_multiline_command_preserved() {
        let input = "svc:\n  cmd: |\n    FOO=1 \\\n    python -m thing \\\n      --flag\n";
        let specs = parse_descriptor(input, Path::new("/base")).unwrap();
        assert!(specs[0].cmd.contains("FOO=1"));
        assert!(specs[0].cmd.contains("--flag"));
    }

    // -------------------------------------------------------------------
    // Environment merge
    // -------------------------------------------------------------------

    fn spec_with_env(env: &[(&str, &str)]) -> ServiceSpec {
        ServiceSpec {
            name: "t".to_string(),
            cmd: "env".to_string(),
            cwd: None,
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_spec_env_beats_dotenv() {
        let spec = spec_with_env(&[("PMO_TEST_FOO", "from-spec")]);
        let dotenv = vec![("PMO_TEST_FOO".to_string(), "from-env".to_string())];
        let env = effective_env(&spec, &dotenv);
        assert_eq!(env.get("PMO_TEST_FOO").unwrap(), "from-spec");
    }

    #[test]
    fn test_dotenv_beats_parent() {
        let spec = spec_with_env(&[]);
        let dotenv = vec![("PMO_TEST_ONLY_DOTENV".to_string(), "x".to_string())];
        let env = effective_env(&spec, &dotenv);
        assert_eq!(env.get("PMO_TEST_ONLY_DOTENV").unwrap(), "x");
    }

    #[test]
    fn test_parent_env_passes_through() {
        let env = effective_env(&spec_with_env(&[]), &[]);
        assert!(env.contains_key("PATH"));
    }

    // -------------------------------------------------------------------
    // Selection
    // -------------------------------------------------------------------

    fn three_specs() -> Vec<ServiceSpec> {
        ["web", "api", "worker"]
            .iter()
            .map(|n| ServiceSpec {
                name: n.to_string(),
                cmd: "sleep 1".to_string(),
                cwd: None,
                env: HashMap::new(),
            })
            .collect()
    }

    #[test]
    fn test_select_by_name() {
        let specs = three_specs();
        let (picked, unknown) = resolve_selection(&specs, &["api".to_string()]);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "api");
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_select_by_numeric_id() {
        let specs = three_specs();
        let (picked, _) = resolve_selection(&specs, &["1".to_string(), "3".to_string()]);
        let names: Vec<&str> = picked.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["web", "worker"]);
    }

    #[test]
    fn test_select_all_keyword() {
        let specs = three_specs();
        let (picked, unknown) =
            resolve_selection(&specs, &["all".to_string(), "bogus".to_string()]);
        assert_eq!(picked.len(), 3);
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_select_unknown_reported() {
        let specs = three_specs();
        let (picked, unknown) =
            resolve_selection(&specs, &["web".to_string(), "nope".to_string()]);
        assert_eq!(picked.len(), 1);
        assert_eq!(unknown, vec!["nope"]);
    }

    #[test]
    fn test_select_out_of_range_id_unknown() {
        let specs = three_specs();
        let (picked, unknown) = resolve_selection(&specs, &["0".to_string(), "4".to_string()]);
        assert!(picked.is_empty());
        assert_eq!(unknown.len(), 2);
    }

    #[test]
    fn test_select_deduplicates() {
        let specs = three_specs();
        let (picked, _) = resolve_selection(
            &specs,
            &["web".to_string(), "1".to_string(), "web".to_string()],
        );
        assert_eq!(picked.len(), 1);
    }
}
