//! Builds the argument vector for `task run`.

use zeroshot_types::OutputFormat;

/// Strict-schema mode requires a schema to enforce, and is selected
/// unless the agent has explicitly opted out via `strict: false`.
pub fn is_strict_mode(output_format: &OutputFormat) -> bool {
    output_format.json_schema.is_some() && output_format.strict
}

/// `task run --output-format <json|stream-json> [-v] [--json-schema <schema>] <prompt>`.
/// In non-strict mode a configured schema is folded into the prompt text
/// instead of passed as a flag.
pub fn build_run_argv(output_format: &OutputFormat, prompt: &str) -> Vec<String> {
    let mut argv = vec!["run".to_string(), "--output-format".to_string()];

    if is_strict_mode(output_format) {
        argv.push("json".to_string());
        if output_format.verbose {
            argv.push("-v".to_string());
        }
        argv.push("--json-schema".to_string());
        let schema = output_format
            .json_schema
            .as_ref()
            .expect("is_strict_mode implies json_schema is Some");
        argv.push(schema.to_string());
        argv.push(prompt.to_string());
    } else {
        argv.push("stream-json".to_string());
        if output_format.verbose {
            argv.push("-v".to_string());
        }
        argv.push(fold_schema_into_prompt(prompt, output_format.json_schema.as_ref()));
    }

    argv
}

fn fold_schema_into_prompt(prompt: &str, schema: Option<&serde_json::Value>) -> String {
    match schema {
        Some(schema) => {
            let schema_text = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
            format!("{prompt}\n\nRespond with JSON matching this schema:\n{schema_text}")
        }
        None => prompt.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_mode_uses_json_schema_flag() {
        let output_format = OutputFormat {
            json_schema: Some(serde_json::json!({"type": "object"})),
            strict: true,
            verbose: false,
        };
        let argv = build_run_argv(&output_format, "do the thing");
        assert!(argv.contains(&"--json-schema".to_string()));
        assert!(argv.contains(&"json".to_string()));
        assert_eq!(argv.last().unwrap(), "do the thing");
    }

    #[test]
    fn schema_present_defaults_to_strict_mode() {
        let output_format = OutputFormat {
            json_schema: Some(serde_json::json!({"type": "object"})),
            ..OutputFormat::default()
        };
        assert!(is_strict_mode(&output_format));
    }

    #[test]
    fn strict_opt_out_folds_schema_into_prompt_instead_of_flag() {
        let output_format = OutputFormat {
            json_schema: Some(serde_json::json!({"type": "object", "required": ["path"]})),
            strict: false,
            verbose: false,
        };
        let argv = build_run_argv(&output_format, "do the thing");
        assert!(!argv.contains(&"--json-schema".to_string()));
        assert!(argv.contains(&"stream-json".to_string()));
        let folded_prompt = argv.last().unwrap();
        assert!(folded_prompt.starts_with("do the thing"));
        assert!(folded_prompt.contains("required"));
    }

    #[test]
    fn non_strict_mode_omits_schema_flag() {
        let output_format = OutputFormat {
            json_schema: None,
            ..OutputFormat::default()
        };
        let argv = build_run_argv(&output_format, "do the thing");
        assert!(!argv.contains(&"--json-schema".to_string()));
        assert!(argv.contains(&"stream-json".to_string()));
        assert_eq!(argv.last().unwrap(), "do the thing");
    }

    #[test]
    fn verbose_flag_is_positioned_before_the_prompt() {
        let output_format = OutputFormat {
            json_schema: None,
            strict: false,
            verbose: true,
        };
        let argv = build_run_argv(&output_format, "prompt text");
        assert!(argv.contains(&"-v".to_string()));
        assert_eq!(argv.last().unwrap(), "prompt text");
    }
}
