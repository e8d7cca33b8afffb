use std::{env, env::VarError};

/// There's no real CLI for the bridge, so just do quick 'n dirty. Returns true if help was printed.
pub fn handle_command_line_args() -> bool {
    let has_cli_args = env::args().count() > 1;
    if has_cli_args {
        // We don't expect any CLI args, so always print the help
        display_readme();
        display_envs();
    }
    has_cli_args
}

fn display_readme() {
    const README: &str = include_str!("./cli-help.txt");
    println!("\n{README}\n");
}

fn display_envs() {
    // Be explicit about which envars to print, so as to avoid accidentally exposing secrets
    const DISPLAY_ENVS: [&str; 25] = [
        "RUST_LOG",
        "CBG_POCKETBASE_URL",
        "CBG_POCKETBASE_EMAIL",
        "CBG_POCKETBASE_PAGE_SIZE",
        "CBG_AUTH_REFRESH_SECS",
        "CBG_CHECKOUT_DRIVER_URL",
        "CBG_PROVIDER_NAME",
        "CBG_DRIVER_TIMEOUT_SECS",
        "CBG_ORDER_COLLECTION",
        "CBG_CREDIT_COLLECTION",
        "CBG_VERIFY_INTERVAL_SECS",
        "CBG_VERIFY_TIMEOUT_SECS",
        "CBG_VERIFY_CONCURRENCY",
        "CBG_EXPORT_CONCURRENCY",
        "CBG_EXPORT_QUEUE_SIZE",
        "CBG_SESSION_TTL_SECS",
        "CBG_SESSION_SWEEP_SECS",
        "CBG_GATE_TTL_SECS",
        "CBG_GATE_SWEEP_SECS",
        "CBG_SHUTDOWN_GRACE_SECS",
        "CBG_BACKOFF_BASE_SECS",
        "CBG_BACKOFF_CAP_SECS",
        "CBG_BACKOFF_HEALTHY_SECS",
        "CBG_SUCCESS_MARKER",
        "CBG_FAILURE_MARKER",
    ];

    println!("Current environment values (EXCLUDING variables that contain secrets):");
    DISPLAY_ENVS.iter().for_each(|&name| {
        let val = match env::var(name) {
            Ok(s) => s,
            Err(VarError::NotPresent) => "Not set".into(),
            Err(VarError::NotUnicode(s)) => format!("Invalid value: {}", s.to_string_lossy()),
        };
        println!("  {name:<35} {val:<15}");
    })
}
