use std::io::{self, BufRead, IsTerminal, Write};
use std::process;

use flagpanel_lib::client::{FlagCache, HttpFlagsApi, SessionClient, SharedToken};
use flagpanel_lib::{FeatureFlag, FlagError};

use crate::server::config::RemoteConfig;

/// Server URL and credentials the remote commands use.
#[derive(Debug, Clone)]
pub struct Remote {
    pub url: String,
    pub token: Option<String>,
}

/// Resolve the server URL from: CLI arg (or FP_URL) > flagpanel.toml
/// Resolve the token from: CLI arg (or FP_TOKEN) > flagpanel.toml
pub fn resolve_remote(url_arg: Option<&str>, token_arg: Option<&str>, config: &RemoteConfig) -> Remote {
    let url = url_arg
        .map(String::from)
        .or_else(|| config.url.clone())
        .unwrap_or_else(|| "http://localhost:8080".to_string());
    let token = token_arg.map(String::from).or_else(|| config.token.clone());
    Remote { url, token }
}

/// Parse an on/off value the way operators type it.
pub fn parse_switch(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "on" | "1" | "yes" | "enabled" => Some(true),
        "false" | "off" | "0" | "no" | "disabled" => Some(false),
        _ => None,
    }
}

/// Parse `key=on` style assignments.
pub fn parse_assignment(raw: &str) -> Result<FeatureFlag, String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing key in '{}'", raw));
    }
    let enabled = parse_switch(value).ok_or_else(|| format!("'{}' is not on or off", value.trim()))?;
    Ok(FeatureFlag {
        key: key.to_string(),
        enabled,
    })
}

fn fail(err: FlagError) -> ! {
    match err {
        FlagError::Unauthorized => {
            eprintln!("Unauthorized. Run `flagpanel login`, pass --token, or set FP_TOKEN");
        }
        other => eprintln!("Error: {}", other),
    }
    process::exit(1);
}

fn connect(remote: &Remote, strict: bool) -> FlagCache<HttpFlagsApi> {
    let api = HttpFlagsApi::new(&remote.url, SharedToken::new(remote.token.clone()))
        .unwrap_or_else(|e| fail(e));
    FlagCache::new(api).strict(strict)
}

fn confirm(prompt: &str) -> bool {
    if !io::stdin().is_terminal() {
        eprintln!("Refusing to continue without confirmation; pass --yes");
        return false;
    }
    eprint!("{} [y/N] ", prompt);
    let _ = io::stderr().flush();
    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

pub async fn run_list(remote: &Remote, search: Option<&str>, json: bool) {
    let cache = connect(remote, false);
    let listing = cache.mutate().await.unwrap_or_else(|e| fail(e));

    if json {
        match serde_json::to_string_pretty(&listing) {
            Ok(out) => println!("{}", out),
            Err(e) => {
                eprintln!("Error: {}", e);
                process::exit(1);
            }
        }
        return;
    }

    if listing.is_maintenance {
        println!("maintenance mode: ON");
    }
    let flags = listing.search(search.unwrap_or(""));
    if flags.is_empty() {
        println!("no flags");
        return;
    }
    for flag in flags {
        let mark = if flag.enabled { "x" } else { " " };
        println!("[{}] {}", mark, flag.key);
    }
}

pub async fn run_create(remote: &Remote, key: &str, strict: bool) {
    let cache = connect(remote, strict);
    cache.create(key).await.unwrap_or_else(|e| fail(e));
    println!("created {}", key.trim());
}

pub async fn run_set(remote: &Remote, key: &str, enabled: bool, strict: bool) {
    let cache = connect(remote, strict);
    cache.set_enabled(key, enabled).await.unwrap_or_else(|e| fail(e));
    println!("{} {}", key.trim(), if enabled { "enabled" } else { "disabled" });
}

pub async fn run_toggle(remote: &Remote, key: &str, strict: bool) {
    let cache = connect(remote, strict);
    let enabled = cache.toggle(key).await.unwrap_or_else(|e| fail(e));
    println!("{} {}", key.trim(), if enabled { "enabled" } else { "disabled" });
}

pub async fn run_rename(remote: &Remote, old_key: &str, new_key: &str, strict: bool) {
    let cache = connect(remote, strict);
    cache
        .rename(old_key, new_key)
        .await
        .unwrap_or_else(|e| fail(e));
    println!("renamed {} to {}", old_key.trim(), new_key.trim());
}

pub async fn run_delete(remote: &Remote, keys: &[String], yes: bool, strict: bool) {
    if keys.is_empty() {
        eprintln!("No keys given");
        process::exit(1);
    }
    if !yes && !confirm(&format!("Delete {} flag(s): {}?", keys.len(), keys.join(", "))) {
        process::exit(1);
    }

    let cache = connect(remote, strict);
    match cache.delete_many(keys).await {
        Ok(count) => println!("deleted {} flag(s)", count),
        Err(e) => {
            eprintln!("Failed to delete some flags");
            fail(e);
        }
    }
}

pub async fn run_maintenance(remote: &Remote, state: Option<&str>, strict: bool) {
    let cache = connect(remote, strict);
    let Some(state) = state else {
        let listing = cache.mutate().await.unwrap_or_else(|e| fail(e));
        println!("maintenance mode: {}", if listing.is_maintenance { "ON" } else { "OFF" });
        return;
    };

    let enabled = parse_switch(state).unwrap_or_else(|| {
        eprintln!("Expected on or off, got '{}'", state);
        process::exit(1);
    });
    cache.set_maintenance(enabled).await.unwrap_or_else(|e| fail(e));
    println!("maintenance mode: {}", if enabled { "ON" } else { "OFF" });
}

/// Stage every assignment and send them as one batch.
pub async fn run_save(remote: &Remote, assignments: &[String], strict: bool) {
    let cache = connect(remote, strict);
    cache.mutate().await.unwrap_or_else(|e| fail(e));

    for raw in assignments {
        match parse_assignment(raw) {
            Ok(flag) => cache.stage(&flag.key, flag.enabled),
            Err(e) => {
                eprintln!("Invalid assignment: {}", e);
                process::exit(1);
            }
        }
    }

    let pending = cache.pending();
    if pending.is_empty() {
        println!("nothing to save");
        return;
    }
    cache.save_pending().await.unwrap_or_else(|e| fail(e));
    println!("saved {} change(s)", pending.len());
}

/// Read one line from stdin, prompting when it is a terminal.
pub fn read_password() -> String {
    if io::stdin().is_terminal() {
        eprint!("Password: ");
        let _ = io::stderr().flush();
    }
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line).is_err() {
        eprintln!("Failed to read password");
        process::exit(1);
    }
    line.trim_end_matches(['\r', '\n']).to_string()
}

/// Sign in and print the session token for use as FP_TOKEN.
pub async fn run_login(url: &str, email: &str, password: Option<String>) {
    let password = password.unwrap_or_else(read_password);

    let session = SessionClient::new(url).unwrap_or_else(|e| fail(e));
    let user = session
        .sign_in(email, &password)
        .await
        .unwrap_or_else(|e| fail(e));
    match session.token() {
        Some(token) => {
            eprintln!("signed in as {}", user.email);
            println!("{}", token);
        }
        None => {
            eprintln!("Server did not return a session token");
            process::exit(1);
        }
    }
}
