use anyhow::{Result, bail};
use std::io::{self, BufRead, IsTerminal};
use zeroize::Zeroizing;

pub const MASTER_PASSWORD_ENV: &str = "COLDVAULT_PASSWORD";
pub const VAULT_PASSWORD_ENV: &str = "COLDVAULT_VAULT_PASSWORD";
pub const DRIVE_PASSWORD_ENV: &str = "COLDVAULT_DRIVE_PASSWORD";
pub const BACKUP_PASSWORD_ENV: &str = "COLDVAULT_BACKUP_PASSWORD";
pub const RECOVERY_PHRASE_ENV: &str = "COLDVAULT_RECOVERY_PHRASE";
pub const SECRET_ENV: &str = "COLDVAULT_SECRET";

/// Read a secret from `env`, then a piped stdin line, then a TTY prompt.
///
/// Piped input is consumed one line per secret, so several secrets can be
/// fed in order:
/// `printf '%s\n%s\n' "$MASTER" "$VAULT_PW" | coldvault item decrypt <id>`
pub fn read_secret(env: &str, prompt: &str) -> Result<Zeroizing<String>> {
    if let Some(pw) = from_env(env) {
        return Ok(pw);
    }

    if !io::stdin().is_terminal() {
        let pw = read_stdin_line()?;
        if !pw.is_empty() {
            return Ok(pw);
        }
    } else {
        let pw = Zeroizing::new(rpassword::prompt_password(format!("{prompt}: "))?);
        if !pw.is_empty() {
            return Ok(pw);
        }
    }

    bail!("no {} provided", prompt.to_lowercase())
}

/// Like [`read_secret`], but an interactive prompt asks twice.
pub fn read_new_secret(env: &str, prompt: &str) -> Result<Zeroizing<String>> {
    if from_env(env).is_some() || !io::stdin().is_terminal() {
        return read_secret(env, prompt);
    }

    let pw1 = Zeroizing::new(rpassword::prompt_password(format!("{prompt}: "))?);
    let pw2 = Zeroizing::new(rpassword::prompt_password(format!(
        "Confirm {}: ",
        prompt.to_lowercase()
    ))?);

    if pw1.is_empty() {
        bail!("{} cannot be empty", prompt.to_lowercase());
    }

    if pw1 != pw2 {
        bail!("{}s do not match", prompt.to_lowercase());
    }

    Ok(pw1)
}

fn from_env(env: &str) -> Option<Zeroizing<String>> {
    std::env::var(env)
        .ok()
        .filter(|pw| !pw.is_empty())
        .map(Zeroizing::new)
}

fn read_stdin_line() -> Result<Zeroizing<String>> {
    let mut buf = Zeroizing::new(String::new());
    io::stdin().lock().read_line(&mut buf)?;
    trim_newline(&mut buf);
    Ok(buf)
}

fn trim_newline(s: &mut String) {
    while s.ends_with('\n') || s.ends_with('\r') {
        s.pop();
    }
}
