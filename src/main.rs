use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
mod auth;
use coldvault::config::{self, KdfConfig};
use coldvault::crypto::digest::generate_recovery_phrase;
use coldvault::store::{KeyFamily, KeyRole, NewItem};
use coldvault::{
    BackupRequest, CancelToken, ColdVault, Drive, ErrorKind, KdfParams, PasswordScope,
    RestoreRequest, SystemDevices, TrustLevel,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use zeroize::Zeroizing;

#[derive(Debug, clap::Args)]
struct Argon2Args {
    /// Argon2 memory cost in KiB for new envelopes (default: 65536)
    #[arg(long = "argon-mem", global = true)]
    mem_cost_kib: Option<u32>,

    /// Argon2 time cost / iterations (default: 3)
    #[arg(long = "argon-time", global = true)]
    time_cost: Option<u32>,

    /// Argon2 parallelism (default: 1)
    #[arg(long = "argon-parallelism", global = true)]
    parallelism: Option<u32>,
}

impl Argon2Args {
    fn apply(&self, kdf: &mut KdfConfig) -> Result<()> {
        let merged = KdfParams::new(
            self.mem_cost_kib.unwrap_or(kdf.memory_kib),
            self.time_cost.unwrap_or(kdf.iterations),
            self.parallelism.unwrap_or(kdf.parallelism),
        )?;
        kdf.memory_kib = merged.mem_cost_kib();
        kdf.iterations = merged.time_cost();
        kdf.parallelism = merged.parallelism();
        Ok(())
    }
}

#[derive(Debug, Parser)]
#[command(name = "coldvault")]
#[command(
    version,
    about = "Offline key vault with encrypted cold-storage backups on removable drives."
)]
struct Cli {
    /// Path to the config file
    #[arg(long, global = true, value_name = "PATH", env = "COLDVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Directory of the secret store and drive trust table
    #[arg(long, global = true, value_name = "DIR", env = "COLDVAULT_DIR")]
    data_dir: Option<PathBuf>,

    /// Owner of stored passwords
    #[arg(long, global = true, env = "COLDVAULT_OWNER", default_value = "local")]
    owner: String,

    #[command(flatten)]
    argon2: Argon2Args,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Initializes the secret store
    Init,

    #[command(flatten)]
    Open(StoreCommand),
}

/// Commands that need an existing store.
#[derive(Debug, Subcommand)]
enum StoreCommand {
    /// Manages vaults
    #[command(subcommand)]
    Vault(VaultCommand),

    /// Manages keys stored in a vault
    #[command(subcommand)]
    Item(ItemCommand),

    /// Manages stored drive and vault passwords
    #[command(subcommand)]
    Password(PasswordCommand),

    /// Manages removable drives
    #[command(subcommand)]
    Drive(DriveCommand),

    /// Writes and restores backups
    #[command(subcommand)]
    Backup(BackupCommand),
}

#[derive(Debug, Subcommand)]
enum VaultCommand {
    /// Creates a vault with its own password
    #[command(arg_required_else_help = true)]
    Create { name: String },

    /// Lists vaults
    List,

    /// Re-encrypts every item of a vault under a new password
    #[command(arg_required_else_help = true)]
    Rotate { vault: String },
}

#[derive(Debug, Subcommand)]
enum ItemCommand {
    /// Encrypts a private key into a vault; the secret is read like a password
    #[command(arg_required_else_help = true)]
    Add {
        vault: String,
        #[arg(long)]
        family: KeyFamily,
        #[arg(long, default_value = "standard")]
        role: KeyRole,
        #[arg(long, default_value = "mainnet")]
        network: String,
        /// Address or other public identifier
        #[arg(long = "public-id")]
        public_identifier: String,
        #[arg(long, default_value = "")]
        public_key: String,
        #[arg(long, default_value = "external")]
        entropy_source: String,
        #[arg(long, default_value_t = false)]
        quantum_enhanced: bool,
    },

    /// Lists items of a vault
    #[command(arg_required_else_help = true)]
    List {
        vault: String,
        /// List trashed items instead
        #[arg(long, default_value_t = false)]
        trash: bool,
    },

    /// Shows item metadata
    #[command(arg_required_else_help = true)]
    Show { item: String },

    /// Prints the decrypted private key
    #[command(arg_required_else_help = true)]
    Decrypt { item: String },

    /// Moves an item to the trash
    #[command(arg_required_else_help = true)]
    Trash { item: String },

    /// Takes an item back out of the trash
    #[command(arg_required_else_help = true)]
    Restore { item: String },

    /// Permanently deletes a trashed item
    #[command(arg_required_else_help = true)]
    Purge { item: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Target {
    Drive,
    Vault,
}

#[derive(Debug, Subcommand)]
enum PasswordCommand {
    /// Stores the password of a drive or vault
    #[command(arg_required_else_help = true)]
    Save {
        kind: Target,
        target: String,
        #[arg(long)]
        hint: Option<String>,
    },

    /// Prints a stored password
    #[command(arg_required_else_help = true)]
    Get { kind: Target, target: String },

    /// Changes the hint of a stored password, keeping the password
    #[command(arg_required_else_help = true)]
    Hint {
        kind: Target,
        target: String,
        /// New hint; omit to clear it
        hint: Option<String>,
    },

    /// Deletes a stored password
    #[command(arg_required_else_help = true)]
    Delete { kind: Target, target: String },

    /// Lists stored passwords of the owner
    List,
}

#[derive(Debug, Subcommand)]
enum DriveCommand {
    /// Lists removable drives
    List {
        /// Rescan even if the last scan is recent
        #[arg(long, default_value_t = false)]
        refresh: bool,
    },

    /// Sets the trust level of a drive
    #[command(arg_required_else_help = true)]
    Trust { drive: String, level: TrustLevel },

    /// Erases the drive and creates an encrypted container on it
    #[command(arg_required_else_help = true)]
    Format {
        drive: String,
        /// Confirm that everything on the drive is destroyed
        #[arg(long, default_value_t = false)]
        yes: bool,
        /// Store the new drive password
        #[arg(long, default_value_t = false)]
        save_password: bool,
    },

    /// Erases the drive and creates a plain filesystem on it
    #[command(arg_required_else_help = true)]
    FormatPlain {
        drive: String,
        #[arg(long)]
        label: Option<String>,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },

    /// Opens the encrypted container
    #[command(arg_required_else_help = true)]
    Unlock { drive: String },

    /// Closes the encrypted container
    #[command(arg_required_else_help = true)]
    Lock { drive: String },

    /// Mounts the drive and prints the mount point
    #[command(arg_required_else_help = true)]
    Mount { drive: String },

    #[command(arg_required_else_help = true)]
    Unmount { drive: String },

    /// Unmounts, locks and flushes the drive for removal
    #[command(arg_required_else_help = true)]
    Eject { drive: String },

    /// Removes a detached drive from the trust table
    #[command(arg_required_else_help = true)]
    Forget { drive: String },
}

#[derive(Debug, Subcommand)]
enum BackupCommand {
    /// Writes every active item of a vault to a drive
    #[command(arg_required_else_help = true)]
    Create {
        vault: String,
        drive: String,
        /// Erase and encrypt the drive first
        #[arg(long, default_value_t = false)]
        format: bool,
        /// Generate a 24-word recovery phrase and print it once
        #[arg(long, default_value_t = false)]
        generate_phrase: bool,
    },

    /// Lists complete backups on a drive
    #[command(arg_required_else_help = true)]
    List { drive: String },

    /// Checks item hashes of a backup without decrypting
    #[command(arg_required_else_help = true)]
    Verify { drive: String, backup: String },

    /// Reads a backup back, optionally importing it into a vault
    #[command(arg_required_else_help = true)]
    Restore {
        drive: String,
        /// Backup id (default: the newest)
        #[arg(long)]
        backup: Option<String>,
        /// Vault to import the restored items into
        #[arg(long)]
        into: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Cli::parse();

    let mut config = match &args.config {
        Some(path) => config::load_from_path(path)?,
        None => config::load()?,
    };
    if let Some(dir) = &args.data_dir {
        config.data_dir = Some(dir.clone());
    }
    args.argon2.apply(&mut config.kdf)?;

    let backend = Arc::new(SystemDevices::new(config.privilege_command.clone()));
    match args.command {
        Commands::Init => {
            let master = auth::read_new_secret(auth::MASTER_PASSWORD_ENV, "Password")?;
            let vault = ColdVault::init(config, master, backend).await?;
            println!(
                "store initialized at {}",
                vault.config().store_path()?.display()
            );
        }
        Commands::Open(command) => {
            let master = auth::read_secret(auth::MASTER_PASSWORD_ENV, "Password")?;
            let vault = ColdVault::open(config, master, backend).await?;
            let owner = args.owner.as_str();
            match command {
                StoreCommand::Vault(cmd) => run_vault(&vault, owner, cmd).await?,
                StoreCommand::Item(cmd) => run_item(&vault, owner, cmd).await?,
                StoreCommand::Password(cmd) => run_password(&vault, owner, cmd).await?,
                StoreCommand::Drive(cmd) => run_drive(&vault, owner, cmd).await?,
                StoreCommand::Backup(cmd) => run_backup(&vault, owner, cmd).await?,
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

async fn run_vault(vault: &ColdVault, owner: &str, cmd: VaultCommand) -> Result<()> {
    let store = vault.store();
    match cmd {
        VaultCommand::Create { name } => {
            let password = auth::read_new_secret(auth::VAULT_PASSWORD_ENV, "Vault password")?;
            let id = store.create_vault(&name, &password)?;
            println!("vault '{name}' created: {id}");
        }
        VaultCommand::List => {
            let vaults = store.list_vaults()?;
            if vaults.is_empty() {
                println!("No vaults.");
                return Ok(());
            }
            let id_width = column_width(vaults.iter().map(|v| v.id.len()), "Id");
            let name_width = column_width(vaults.iter().map(|v| v.name.len()), "Name");
            println!("{:<id_width$}  {:<name_width$}  Items  Trash", "Id", "Name");
            for v in vaults {
                println!(
                    "{:<id_width$}  {:<name_width$}  {:>5}  {:>5}",
                    v.id, v.name, v.active_items, v.trashed_items
                );
            }
        }
        VaultCommand::Rotate { vault: name } => {
            let vault_id = store.resolve_vault(&name)?;
            let old = auth::read_secret(auth::VAULT_PASSWORD_ENV, "Current vault password")?;
            let new =
                auth::read_new_secret("COLDVAULT_NEW_VAULT_PASSWORD", "New vault password")?;
            let count = store.rotate_vault_password(&vault_id, &old, &new)?;
            let scope = PasswordScope::vault(owner, &vault_id);
            if vault.get_password(scope.clone()).await.is_ok() {
                vault.save_password(scope, new, None).await?;
                println!("stored vault password updated");
            }
            println!("vault '{name}' re-encrypted ({count} item(s))");
        }
    }
    Ok(())
}

async fn run_item(vault: &ColdVault, owner: &str, cmd: ItemCommand) -> Result<()> {
    let store = vault.store();
    match cmd {
        ItemCommand::Add {
            vault: name,
            family,
            role,
            network,
            public_identifier,
            public_key,
            entropy_source,
            quantum_enhanced,
        } => {
            let vault_id = store.resolve_vault(&name)?;
            let password = vault_password(vault, owner, &vault_id).await?;
            let secret = auth::read_secret(auth::SECRET_ENV, "Private key")?;
            let item = NewItem {
                key_family: family,
                role,
                network,
                public_identifier,
                public_key,
                entropy_source,
                quantum_enhanced,
                secret: Zeroizing::new(secret.as_bytes().to_vec()),
            };
            let id = store.put_item(&vault_id, &password, item)?;
            println!("stored item {id}");
        }
        ItemCommand::List { vault: name, trash } => {
            let vault_id = store.resolve_vault(&name)?;
            let items = if trash {
                store.list_trash(&vault_id)?
            } else {
                vault.list_items(&vault_id)?
            };
            if items.is_empty() {
                println!("No items.");
                return Ok(());
            }
            for item in items {
                println!(
                    "{}  {}  {}  {}  {}",
                    item.id, item.key_family, item.role, item.network, item.public_identifier
                );
            }
        }
        ItemCommand::Show { item } => {
            let meta = store.get_item_metadata(&item)?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
        }
        ItemCommand::Decrypt { item } => {
            let meta = store.get_item_metadata(&item)?;
            let password = vault_password(vault, owner, &meta.vault_id).await?;
            let secret = vault.decrypt_item(&item, password).await?;
            match std::str::from_utf8(&secret) {
                Ok(text) => println!("{text}"),
                Err(_) => println!("{}", hex::encode(secret.as_slice())),
            }
        }
        ItemCommand::Trash { item } => {
            store.trash_item(&item)?;
            println!("item {item} moved to trash");
        }
        ItemCommand::Restore { item } => {
            store.restore_item(&item)?;
            println!("item {item} restored");
        }
        ItemCommand::Purge { item } => {
            store.purge_item(&item)?;
            println!("item {item} purged");
        }
    }
    Ok(())
}

async fn run_password(vault: &ColdVault, owner: &str, cmd: PasswordCommand) -> Result<()> {
    match cmd {
        PasswordCommand::Save { kind, target, hint } => {
            let scope = scope(owner, kind, &target);
            let password =
                auth::read_new_secret("COLDVAULT_TARGET_PASSWORD", "Password to store")?;
            vault.save_password(scope.clone(), password, hint).await?;
            println!("password for {scope} stored");
        }
        PasswordCommand::Get { kind, target } => {
            let password = vault.get_password(scope(owner, kind, &target)).await?;
            println!("{}", password.as_str());
        }
        PasswordCommand::Hint { kind, target, hint } => {
            let scope = scope(owner, kind, &target);
            vault.store().update_password_hint(&scope, hint)?;
            println!("hint for {scope} updated");
        }
        PasswordCommand::Delete { kind, target } => {
            let scope = scope(owner, kind, &target);
            if vault.delete_password(&scope)? {
                println!("password for {scope} deleted");
            } else {
                println!("no password stored for {scope}");
            }
        }
        PasswordCommand::List => {
            let passwords = vault.store().list_passwords(owner)?;
            if passwords.is_empty() {
                println!("No stored passwords.");
                return Ok(());
            }
            for p in passwords {
                println!(
                    "{}  {}  {}",
                    p.scope,
                    p.updated_at.to_rfc3339(),
                    p.hint.unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

async fn run_drive(vault: &ColdVault, owner: &str, cmd: DriveCommand) -> Result<()> {
    let lifecycle = vault.lifecycle();
    match cmd {
        DriveCommand::List { refresh } => {
            let drives = if refresh {
                vault.registry().refresh().await?
            } else {
                vault.list_drives().await?
            };
            print_drives(&drives);
        }
        DriveCommand::Trust { drive, level } => {
            vault.list_drives().await?;
            let drive = vault.set_trust_level(&drive, level)?;
            println!("drive {} trust set to {}", drive.id, drive.trust_level);
        }
        DriveCommand::Format {
            drive,
            yes,
            save_password,
        } => {
            confirm_destroy(&drive, yes)?;
            vault.list_drives().await?;
            let password = auth::read_new_secret(auth::DRIVE_PASSWORD_ENV, "Drive password")?;
            let formatted = vault.format_and_encrypt(&drive, &password).await?;
            if save_password {
                vault
                    .save_password(PasswordScope::drive(owner, &drive), password, None)
                    .await?;
            }
            println!("drive {} is {}", formatted.id, formatted.filesystem_state);
        }
        DriveCommand::FormatPlain { drive, label, yes } => {
            confirm_destroy(&drive, yes)?;
            vault.list_drives().await?;
            let formatted = lifecycle.format_plain(&drive, label.as_deref()).await?;
            println!("drive {} is {}", formatted.id, formatted.filesystem_state);
        }
        DriveCommand::Unlock { drive } => {
            vault.list_drives().await?;
            let password = drive_password(vault, owner, &drive).await?;
            let unlocked = vault.unlock_drive(&drive, &password).await?;
            println!("drive {} is {}", unlocked.id, unlocked.filesystem_state);
        }
        DriveCommand::Lock { drive } => {
            vault.list_drives().await?;
            let locked = lifecycle.lock(&drive).await?;
            println!("drive {} is {}", locked.id, locked.filesystem_state);
        }
        DriveCommand::Mount { drive } => {
            vault.list_drives().await?;
            let mount_point = lifecycle.mount(&drive).await?;
            println!("{}", mount_point.display());
        }
        DriveCommand::Unmount { drive } => {
            vault.list_drives().await?;
            let unmounted = lifecycle.unmount(&drive).await?;
            println!("drive {} is {}", unmounted.id, unmounted.filesystem_state);
        }
        DriveCommand::Eject { drive } => {
            vault.list_drives().await?;
            lifecycle.eject(&drive).await?;
            println!("drive {drive} can be removed");
        }
        DriveCommand::Forget { drive } => {
            vault.list_drives().await?;
            vault.registry().forget(&drive)?;
            println!("drive {drive} forgotten");
        }
    }
    Ok(())
}

async fn run_backup(vault: &ColdVault, owner: &str, cmd: BackupCommand) -> Result<()> {
    vault.list_drives().await?;
    match cmd {
        BackupCommand::Create {
            vault: name,
            drive,
            format,
            generate_phrase,
        } => {
            let vault_id = vault.store().resolve_vault(&name)?;
            let vault_password = vault_password(vault, owner, &vault_id).await?;
            let drive_password = if format {
                Some(auth::read_new_secret(auth::DRIVE_PASSWORD_ENV, "Drive password")?)
            } else {
                locked_drive_password(vault, owner, &drive).await?
            };
            let backup_password =
                auth::read_new_secret(auth::BACKUP_PASSWORD_ENV, "Backup password")?;
            let recovery_phrase = if generate_phrase {
                let phrase = generate_recovery_phrase()?;
                println!("Recovery phrase (shown once, write it down):");
                println!("{}", phrase.as_str());
                phrase
            } else {
                auth::read_new_secret(auth::RECOVERY_PHRASE_ENV, "Recovery phrase")?
            };

            let cancel = CancelToken::new();
            let handler_token = cancel.clone();
            ctrlc::set_handler(move || handler_token.cancel())
                .context("failed to install Ctrl-C handler")?;

            let request = BackupRequest {
                vault_id,
                drive_id: drive,
                vault_password,
                backup_password,
                recovery_phrase,
                format_drive: format,
                drive_password,
            };
            let archive = vault
                .backups()
                .create_backup_with_progress(&request, &cancel, |written, total| {
                    eprintln!("  {written}/{total} item(s) written");
                })
                .await?;
            println!(
                "backup {} written ({} item(s))",
                archive.id,
                archive.manifest.len()
            );
        }
        BackupCommand::List { drive } => {
            let drive_password = locked_drive_password(vault, owner, &drive).await?;
            let archives = vault
                .backups()
                .list_backups(&drive, drive_password.as_deref().map(String::as_str))
                .await?;
            if archives.is_empty() {
                println!("No backups.");
                return Ok(());
            }
            for a in archives {
                println!(
                    "{}  {}  vault {}  {} item(s)",
                    a.id,
                    a.created_at.to_rfc3339(),
                    a.source_vault_id,
                    a.manifest.len()
                );
            }
        }
        BackupCommand::Verify { drive, backup } => {
            let drive_password = locked_drive_password(vault, owner, &drive).await?;
            let report = vault
                .backups()
                .verify_backup(
                    &drive,
                    &backup,
                    drive_password.as_deref().map(String::as_str),
                )
                .await?;
            println!(
                "backup {} intact ({} item(s))",
                report.backup_id, report.verified
            );
        }
        BackupCommand::Restore {
            drive,
            backup,
            into,
        } => {
            let drive_password = locked_drive_password(vault, owner, &drive).await?;
            let backup_password = auth::read_secret(auth::BACKUP_PASSWORD_ENV, "Backup password")?;
            let recovery_phrase =
                auth::read_secret(auth::RECOVERY_PHRASE_ENV, "Recovery phrase")?;
            let request = RestoreRequest {
                drive_id: drive,
                backup_id: backup,
                backup_password,
                recovery_phrase,
                drive_password,
            };
            let restored = vault.restore_backup(&request).await?;

            match into {
                Some(name) => {
                    let vault_id = vault.store().resolve_vault(&name)?;
                    let password = vault_password(vault, owner, &vault_id).await?;
                    let report = vault
                        .store()
                        .import_items(&vault_id, &password, &restored)?;
                    println!(
                        "imported {} item(s), skipped {} already present",
                        report.imported.len(),
                        report.skipped.len()
                    );
                }
                None => {
                    for item in &restored {
                        let m = &item.metadata;
                        println!(
                            "{}  {}  {}  {}",
                            m.id, m.key_family, m.role, m.public_identifier
                        );
                    }
                    println!("{} item(s) verified; use --into to import", restored.len());
                }
            }
        }
    }
    Ok(())
}

fn scope(owner: &str, kind: Target, target: &str) -> PasswordScope {
    match kind {
        Target::Drive => PasswordScope::drive(owner, target),
        Target::Vault => PasswordScope::vault(owner, target),
    }
}

/// Environment first, then a stored password, then a prompt.
async fn scoped_secret(
    vault: &ColdVault,
    scope: PasswordScope,
    env: &str,
    prompt: &str,
) -> Result<Zeroizing<String>> {
    if let Some(pw) = std::env::var(env).ok().filter(|pw| !pw.is_empty()) {
        return Ok(Zeroizing::new(pw));
    }
    match vault.get_password(scope).await {
        Ok(pw) => return Ok(pw),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    auth::read_secret(env, prompt)
}

async fn vault_password(
    vault: &ColdVault,
    owner: &str,
    vault_id: &str,
) -> Result<Zeroizing<String>> {
    scoped_secret(
        vault,
        PasswordScope::vault(owner, vault_id),
        auth::VAULT_PASSWORD_ENV,
        "Vault password",
    )
    .await
}

async fn drive_password(
    vault: &ColdVault,
    owner: &str,
    drive_id: &str,
) -> Result<Zeroizing<String>> {
    scoped_secret(
        vault,
        PasswordScope::drive(owner, drive_id),
        auth::DRIVE_PASSWORD_ENV,
        "Drive password",
    )
    .await
}

/// A drive password, but only when the drive actually needs unlocking.
async fn locked_drive_password(
    vault: &ColdVault,
    owner: &str,
    drive_id: &str,
) -> Result<Option<Zeroizing<String>>> {
    let drive = vault.registry().get(drive_id)?;
    if drive.filesystem_state == coldvault::FilesystemState::EncryptedLocked {
        Ok(Some(drive_password(vault, owner, drive_id).await?))
    } else {
        Ok(None)
    }
}

fn confirm_destroy(drive: &str, yes: bool) -> Result<()> {
    if !yes {
        bail!("formatting destroys everything on drive {drive}; pass --yes to confirm");
    }
    Ok(())
}

fn column_width(lens: impl Iterator<Item = usize>, header: &str) -> usize {
    lens.chain(std::iter::once(header.len())).max().unwrap_or(0)
}

fn print_drives(drives: &[Drive]) {
    if drives.is_empty() {
        println!("No removable drives.");
        return;
    }

    let id_width = column_width(drives.iter().map(|d| d.id.len()), "Id");
    let state_width = column_width(
        drives.iter().map(|d| d.filesystem_state.to_string().len()),
        "State",
    );
    println!(
        "{:<id_width$}   {:<state_width$}  {:<9}  {:<7}  Device",
        "Id", "State", "Trust", "Present"
    );
    for d in drives {
        println!(
            "{:<id_width$}{}  {:<state_width$}  {:<9}  {:<7}  {} {}",
            d.id,
            if d.identity_stable { " " } else { "*" },
            d.filesystem_state.to_string(),
            d.trust_level.to_string(),
            if d.present { "yes" } else { "no" },
            d.device_path.display(),
            d.model.as_deref().unwrap_or("")
        );
    }
    if drives.iter().any(|d| !d.identity_stable) {
        println!("* no hardware serial; identity may change when re-plugged");
    }
}
