//! Build script for cosched-runtime
//!
//! Handles configuration merging:
//! 1. Start with library defaults
//! 2. If COSCHED_CONFIG_RS env var is set, parse user's config file
//! 3. Merge user values over defaults (user wins)
//! 4. Generate OUT_DIR/gen_config.rs
//!
//! User only needs to specify values they want to change.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

/// Configuration parameter definition
struct ConfigParam {
    name: &'static str,
    rust_type: &'static str,
    default_value: &'static str,
}

/// All configuration parameters with their defaults
const CONFIG_PARAMS: &[ConfigParam] = &[
    ConfigParam {
        name: "STACK_SIZE",
        rust_type: "usize",
        default_value: "1024 * 1024", // 1MB
    },
    ConfigParam {
        name: "FD_TABLE_CAPACITY",
        rust_type: "usize",
        default_value: "32",
    },
    ConfigParam {
        name: "EPOLL_TIMEOUT_MS",
        rust_type: "i32",
        default_value: "5000",
    },
    ConfigParam {
        name: "EPOLL_MAX_EVENTS",
        rust_type: "usize",
        default_value: "64",
    },
    ConfigParam {
        name: "PARK_TIMEOUT_MS",
        rust_type: "u64",
        default_value: "100",
    },
    ConfigParam {
        name: "DEBUG_LOGGING",
        rust_type: "bool",
        default_value: "false",
    },
];

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let dest_path = Path::new(&out_dir).join("gen_config.rs");

    // Start with defaults
    let mut config: HashMap<&str, String> = CONFIG_PARAMS
        .iter()
        .map(|p| (p.name, p.default_value.to_string()))
        .collect();

    // If user config specified, parse and merge
    if let Ok(user_path) = env::var("COSCHED_CONFIG_RS") {
        println!("cargo:rerun-if-changed={}", user_path);
        
        match fs::read_to_string(&user_path) {
            Ok(content) => {
                parse_and_merge(&content, &mut config);
                println!("cargo:warning=Using custom config: {}", user_path);
            }
            Err(e) => {
                println!(
                    "cargo:warning=Failed to read COSCHED_CONFIG_RS ({}): {}",
                    user_path, e
                );
            }
        }
    }
    
    println!("cargo:rerun-if-env-changed=COSCHED_CONFIG_RS");

    // Generate merged config file
    let output = generate_config(&config);
    fs::write(&dest_path, &output).expect("Failed to write merged config");
}

/// Parse user's config file and merge values into config map
fn parse_and_merge(content: &str, config: &mut HashMap<&str, String>) {
    // Simple parser for: pub const NAME: TYPE = VALUE;
    // Handles multi-line and various spacing
    
    for line in content.lines() {
        let line = line.trim();
        
        // Skip comments and empty lines
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        
        // Look for "pub const NAME"
        if !line.starts_with("pub const ") {
            continue;
        }
        
        // Extract name and value
        if let Some(parsed) = parse_const_line(line) {
            let (name, value) = parsed;
            
            // Only accept known parameters
            match CONFIG_PARAMS.iter().find(|p| p.name == name) {
                Some(param) => {
                    config.insert(param.name, value);
                }
                None => println!("cargo:warning=Unknown config parameter: {}", name),
            }
        }
    }
}

/// Parse a single const line and return (name, value)
fn parse_const_line(line: &str) -> Option<(String, String)> {
    // Format: pub const NAME: TYPE = VALUE;
    
    // Remove "pub const "
    let rest = line.strip_prefix("pub const ")?.trim();
    
    // Find name (before ':')
    let colon_pos = rest.find(':')?;
    let name = rest[..colon_pos].trim().to_string();
    
    // Find value (after '=', before ';')
    let eq_pos = rest.find('=')?;
    let semi_pos = rest.rfind(';').unwrap_or(rest.len());
    
    let value = rest[eq_pos + 1..semi_pos].trim().to_string();
    
    Some((name, value))
}

/// Generate the merged config Rust file
fn generate_config(config: &HashMap<&str, String>) -> String {
    let mut output = String::new();
    
    output.push_str("// Auto-generated by build.rs - do not edit\n");
    output.push_str("// Configuration merged from library defaults");
    
    if env::var("COSCHED_CONFIG_RS").is_ok() {
        output.push_str(" and user's cosched_config.rs");
    }
    output.push_str("\n\n");
    
    // Generate each constant
    for param in CONFIG_PARAMS {
        let value = config
            .get(param.name)
            .map(String::as_str)
            .unwrap_or(param.default_value);
        output.push_str(&format!(
            "pub const {}: {} = {};\n",
            param.name, param.rust_type, value
        ));
    }
    
    output
}
