//! Preference lookup over the command line and environment, plus the
//! process-wide debug and optimizer toggles derived from it.

use std::env;
use std::sync::OnceLock;

static CLI_ARGS: OnceLock<Vec<String>> = OnceLock::new();

fn cli_args() -> &'static [String] {
    CLI_ARGS.get_or_init(|| env::args().skip(1).collect())
}

/// Name variants accepted when resolving a preference key.
fn name_variants(name: &str) -> Vec<String> {
    let upper = name.to_ascii_uppercase();
    vec![
        name.to_string(),
        upper.clone(),
        format!("dendrite_{name}"),
        format!("DENDRITE_{upper}"),
        format!("dendrite-{name}"),
        format!("DENDRITE-{upper}"),
    ]
}

fn cli_match(arg: &str, variant: &str) -> Option<String> {
    let arg = arg.strip_prefix("--").or_else(|| arg.strip_prefix('-')).unwrap_or(arg);
    let rest = arg.strip_prefix(variant)?;
    match rest.chars().next() {
        None => Some(String::new()),
        Some('=') | Some('_') | Some('-') => Some(rest[1..].to_string()),
        Some(_) => None,
    }
}

/// Resolves a preference: first command-line match wins, else the first
/// environment match, else the caller-supplied default.
pub fn get_global_arg(name: &str, default: &str) -> String {
    let variants = name_variants(name);
    for arg in cli_args() {
        for variant in &variants {
            if let Some(value) = cli_match(arg, variant) {
                return if value.is_empty() { "true".to_string() } else { value };
            }
        }
    }
    for variant in &variants {
        if let Ok(value) = env::var(variant) {
            if !value.trim().is_empty() {
                return value;
            }
        }
    }
    default.to_string()
}

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

pub fn get_global_flag(name: &str, default: bool) -> bool {
    parse_bool(&get_global_arg(name, if default { "true" } else { "false" }))
}

pub fn get_global_int(name: &str, default: i64) -> i64 {
    get_global_arg(name, &default.to_string())
        .trim()
        .parse::<i64>()
        .unwrap_or(default)
}

static FIXED_STATE_FOR_INIT: OnceLock<Option<u64>> = OnceLock::new();
static DEBUG_FILES: OnceLock<bool> = OnceLock::new();

/// Deterministic RNG seed for init ops, when configured.
pub fn fixed_state_for_init() -> Option<u64> {
    *FIXED_STATE_FOR_INIT.get_or_init(|| {
        let raw = get_global_arg("fixed_state_for_init", "");
        raw.trim().parse::<u64>().ok()
    })
}

/// Used by tests that need reproducible uniform fills.
pub fn force_fixed_state_for_init(seed: u64) {
    let _ = FIXED_STATE_FOR_INIT.set(Some(seed));
}

/// When set, the compile pipeline writes `.hlc` and `.llc` artifacts per
/// compiled kernel into the current directory.
pub fn output_debug_files_in_run_directory() -> bool {
    *DEBUG_FILES.get_or_init(|| get_global_flag("output_debug_files_in_run_directory", false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_lookup_accepts_prefixed_variants() {
        env::set_var("DENDRITE_CONFIG_PROBE", "7");
        assert_eq!(get_global_arg("config_probe", "0"), "7");
        env::remove_var("DENDRITE_CONFIG_PROBE");
        assert_eq!(get_global_arg("config_probe", "0"), "0");
    }

    #[test]
    fn cli_matching_strips_dashes_and_separators() {
        assert_eq!(cli_match("--max_visits=5", "max_visits").as_deref(), Some("5"));
        assert_eq!(cli_match("-max_visits-5", "max_visits").as_deref(), Some("5"));
        assert_eq!(cli_match("max_visits_5", "max_visits").as_deref(), Some("5"));
        assert_eq!(cli_match("--max_visits", "max_visits").as_deref(), Some(""));
        assert_eq!(cli_match("--max_visitsx", "max_visits"), None);
    }

    #[test]
    fn flags_parse_the_usual_spellings() {
        assert!(parse_bool("1") && parse_bool("true") && parse_bool("Yes") && parse_bool("on"));
        assert!(!parse_bool("0") && !parse_bool("off") && !parse_bool(""));
    }
}
