use serde::Deserialize;

pub const SERVER_NAME: &str = "pddl-lsp";
pub const DEFAULT_PARSER_DEBOUNCE_MS: u64 = 1000;
pub const DEFAULT_VALIDATION_DEBOUNCE_MS: u64 = 1000;
pub const DEFAULT_MAX_NUMBER_OF_PROBLEMS: usize = 100;
pub const DEFAULT_EPSILON: f64 = 1e-3;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Output format of the VAL `Parser` tool, e.g.
/// `/tmp/domain.pddl: line: 12: Error: Syntax error in domain`.
pub const DEFAULT_VALIDATOR_PATTERN: &str =
    r"(?m)^(?P<file>[^:\n]+):\s*line:\s*(?P<line>\d+):\s*(?P<severity>Error|Warning|Information|Hint)s?:\s*(?P<message>.*)$";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub parser_debounce_ms: u64,
    pub validation_debounce_ms: u64,
    pub max_number_of_problems: usize,
    pub epsilon: f64,
    pub validator: ValidatorSettings,
    pub planner: PlannerSettings,
    pub preprocessor: PreprocessorSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            parser_debounce_ms: DEFAULT_PARSER_DEBOUNCE_MS,
            validation_debounce_ms: DEFAULT_VALIDATION_DEBOUNCE_MS,
            max_number_of_problems: DEFAULT_MAX_NUMBER_OF_PROBLEMS,
            epsilon: DEFAULT_EPSILON,
            validator: ValidatorSettings::default(),
            planner: PlannerSettings::default(),
            preprocessor: PreprocessorSettings::default(),
        }
    }
}

impl Settings {
    /// Reads settings from `initializationOptions` or a
    /// `didChangeConfiguration` payload; both `{ "pddl": {...} }` and the bare
    /// object are accepted. Anything unreadable falls back to defaults.
    pub fn from_value(value: Option<&serde_json::Value>) -> Self {
        let Some(value) = value else {
            return Self::default();
        };
        let scoped = value.get("pddl").unwrap_or(value);
        match serde_json::from_value(scoped.clone()) {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!("Ignoring invalid pddl settings: {}", err);
                Self::default()
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidatorSettings {
    /// Command template with `$(domain)` and `$(problem)` placeholders.
    pub executable: Option<String>,
    pub url: Option<String>,
    pub patterns: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            executable: None,
            url: None,
            patterns: vec![DEFAULT_VALIDATOR_PATTERN.to_string()],
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PlannerSettings {
    pub executable: Option<String>,
    pub url: Option<String>,
    pub asynchronous: bool,
    pub timeout_secs: u64,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            executable: None,
            url: None,
            asynchronous: false,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PreprocessorSettings {
    pub python_path: String,
    pub jinja2_script: Option<String>,
}

impl Default for PreprocessorSettings {
    fn default() -> Self {
        Self {
            python_path: "python".to_string(),
            jinja2_script: None,
        }
    }
}
