use crate::config::PreprocessorSettings;
use crate::error::PreProcessingError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

pub const META_PREFIX: &str = ";;!pre-parsing:";

static STDERR_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)line:?\s*(\d+)").expect("valid line pattern"));

/// Transform selected by a `;;!pre-parsing:{...}` first line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PreProcessor {
    /// Any executable; the text is piped through stdin/stdout.
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// A Python script run with the configured interpreter.
    Python {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// A Jinja2 template rendered with the given JSON data file.
    Jinja2 { data: String },
    Nunjucks { data: String },
}

impl PreProcessor {
    pub fn label(&self) -> &'static str {
        match self {
            PreProcessor::Command { .. } => "command",
            PreProcessor::Python { .. } => "python",
            PreProcessor::Jinja2 { .. } => "jinja2",
            PreProcessor::Nunjucks { .. } => "nunjucks",
        }
    }

    /// Runs the transform with `working_dir` as the current directory, so
    /// relative script and data paths resolve next to the problem file.
    pub fn transform(
        &self,
        text: &str,
        working_dir: Option<&Path>,
        settings: &PreprocessorSettings,
    ) -> Result<String, PreProcessingError> {
        let (program, args) = match self {
            PreProcessor::Command { command, args } => (command.clone(), args.clone()),
            PreProcessor::Python { command, args } => {
                let mut full = vec![command.clone()];
                full.extend(args.iter().cloned());
                (settings.python_path.clone(), full)
            }
            PreProcessor::Jinja2 { data } => {
                let script = settings
                    .jinja2_script
                    .clone()
                    .ok_or(PreProcessingError::NotConfigured("jinja2"))?;
                (settings.python_path.clone(), vec![script, data.clone()])
            }
            PreProcessor::Nunjucks { .. } => {
                return Err(PreProcessingError::Unsupported(self.label().to_string()))
            }
        };
        run_filter(&program, &args, text, working_dir)
    }
}

/// Reads the meta-instruction from the first line, if there is one.
pub fn parse_meta(text: &str) -> Option<Result<PreProcessor, PreProcessingError>> {
    let first_line = text.lines().next()?.trim();
    let json = first_line.strip_prefix(META_PREFIX)?;
    Some(serde_json::from_str(json.trim()).map_err(PreProcessingError::from))
}

fn run_filter(
    program: &str,
    args: &[String],
    text: &str,
    working_dir: Option<&Path>,
) -> Result<String, PreProcessingError> {
    let command_line = std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ");
    tracing::debug!("Pre-processing with '{}'", command_line);

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }

    let spawn_error = |source| PreProcessingError::Spawn {
        command: command_line.clone(),
        source,
    };
    let mut child = command.spawn().map_err(spawn_error)?;
    if let Some(mut stdin) = child.stdin.take() {
        // A filter may exit without draining its input.
        if let Err(err) = stdin.write_all(text.as_bytes()) {
            tracing::debug!("Pre-processor closed stdin early: {}", err);
        }
    }
    let output = child.wait_with_output().map_err(spawn_error)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let line = STDERR_LINE
            .captures(&stderr)
            .and_then(|caps| caps[1].parse::<u32>().ok())
            .map(|line| line.saturating_sub(1));
        return Err(PreProcessingError::Failed {
            command: command_line,
            status: output.status.to_string(),
            stderr,
            line,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
