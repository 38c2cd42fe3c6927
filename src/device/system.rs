//! Backend that drives the Linux block-device tools.
//!
//! Passphrases are written to the child's stdin (`--key-file -`) and never
//! appear on a command line.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{
    BackendError, BackendResult, ContentSignature, DeviceBackend, DeviceProbe, KillSignal,
    UnmountMode, mapper_path,
};

const LSBLK_COLUMNS: &str = "PATH,NAME,TYPE,RM,HOTPLUG,SIZE,SERIAL,MODEL,LABEL,FSTYPE,MOUNTPOINT";
const LUKS_FSTYPE: &str = "crypto_LUKS";
/// cryptsetup exit code for a rejected passphrase.
const CRYPTSETUP_BAD_PASSPHRASE: i32 = 2;
/// fuser exits with 1 when no process matched.
const FUSER_NO_MATCH: i32 = 1;
const MAX_STDERR: usize = 512;

#[derive(Debug, Clone, Default)]
pub struct SystemDevices {
    privilege_command: Option<String>,
}

impl SystemDevices {
    /// `privilege_command` (e.g. `sudo`) is prefixed to every tool that needs
    /// root.
    pub fn new(privilege_command: Option<String>) -> Self {
        Self {
            privilege_command: privilege_command.filter(|c| !c.trim().is_empty()),
        }
    }

    fn command(&self, program: &str) -> Command {
        let mut cmd = match &self.privilege_command {
            Some(prefix) => {
                let mut cmd = Command::new(prefix);
                cmd.arg(program);
                cmd
            }
            None => Command::new(program),
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, program: &str, args: &[&str]) -> BackendResult<String> {
        self.run_inner(program, args, None, &[0]).await
    }

    async fn run_inner(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&[u8]>,
        accepted: &[i32],
    ) -> BackendResult<String> {
        debug!(program, ?args, "running device command");

        let mut cmd = self.command(program);
        cmd.args(args);
        if stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }

        let mut child = cmd.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }
        let output = child.wait_with_output().await?;

        let code = output.status.code();
        if code.is_some_and(|c| accepted.contains(&c)) {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.len() > MAX_STDERR {
            let mut cut = MAX_STDERR;
            while !stderr.is_char_boundary(cut) {
                cut -= 1;
            }
            stderr.truncate(cut);
        }
        Err(BackendError::Command {
            program: program.to_string(),
            code,
            stderr,
        })
    }

    async fn tree(&self, device: &Path) -> BackendResult<Vec<BlockDevice>> {
        let out = self
            .run("lsblk", &["-J", "-b", "-o", LSBLK_COLUMNS, &path_arg(device)])
            .await?;
        parse_lsblk(&out)
    }

    /// The device and everything below it, depth first.
    async fn all_paths(&self, device: &Path) -> BackendResult<Vec<(String, Option<String>)>> {
        fn walk(dev: &BlockDevice, out: &mut Vec<(String, Option<String>)>) {
            out.push((dev.path.clone(), dev.mountpoint.clone()));
            for child in &dev.children {
                walk(child, out);
            }
        }

        let mut out = Vec::new();
        for dev in self.tree(device).await? {
            walk(&dev, &mut out);
        }
        Ok(out)
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<BlockDevice>,
}

#[derive(Debug, Deserialize)]
struct BlockDevice {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, deserialize_with = "flag")]
    rm: bool,
    #[serde(default, deserialize_with = "flag")]
    hotplug: bool,
    #[serde(default, deserialize_with = "size")]
    size: u64,
    serial: Option<String>,
    model: Option<String>,
    label: Option<String>,
    fstype: Option<String>,
    mountpoint: Option<String>,
    #[serde(default)]
    children: Vec<BlockDevice>,
}

/// Older lsblk prints flags as `"0"`/`"1"`, newer as booleans.
fn flag<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
        Number(u8),
    }

    Ok(match Option::<Flag>::deserialize(de)? {
        Some(Flag::Bool(b)) => b,
        Some(Flag::Text(s)) => s.trim() == "1",
        Some(Flag::Number(n)) => n == 1,
        None => false,
    })
}

fn size<'de, D: Deserializer<'de>>(de: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Number(u64),
        Text(String),
    }

    Ok(match Option::<Size>::deserialize(de)? {
        Some(Size::Number(n)) => n,
        Some(Size::Text(s)) => s.trim().parse().unwrap_or(0),
        None => 0,
    })
}

fn parse_lsblk(json: &str) -> BackendResult<Vec<BlockDevice>> {
    serde_json::from_str::<LsblkOutput>(json)
        .map(|out| out.blockdevices)
        .map_err(|err| BackendError::Parse(format!("lsblk output: {err}")))
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Turn one removable disk from lsblk into a probe.
fn probe_disk(disk: &BlockDevice) -> DeviceProbe {
    let partition = disk.children.iter().find(|c| c.kind == "part");
    // A disk without a partition table may carry a filesystem directly.
    let data = partition.unwrap_or(disk);

    let content = match data.fstype.as_deref() {
        None | Some("") => ContentSignature::Empty,
        Some(LUKS_FSTYPE) => ContentSignature::EncryptedContainer,
        Some(fstype) => ContentSignature::Filesystem {
            fstype: fstype.to_string(),
        },
    };

    let crypt = data.children.iter().find(|c| c.kind == "crypt");
    let mapper = crypt.map(|c| {
        Path::new(&c.path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| c.path.clone())
    });
    let top = crypt.unwrap_or(data);

    DeviceProbe {
        device_path: PathBuf::from(&disk.path),
        serial: non_empty(&disk.serial),
        model: non_empty(&disk.model),
        size_bytes: disk.size,
        label: non_empty(&top.label),
        partition: partition.map(|p| PathBuf::from(&p.path)),
        content,
        mapper,
        mount_point: non_empty(&top.mountpoint).map(PathBuf::from),
    }
}

#[async_trait]
impl DeviceBackend for SystemDevices {
    async fn scan(&self) -> BackendResult<Vec<DeviceProbe>> {
        let out = self
            .run("lsblk", &["-J", "-b", "-o", LSBLK_COLUMNS])
            .await?;
        Ok(parse_lsblk(&out)?
            .iter()
            .filter(|d| d.kind == "disk" && (d.rm || d.hotplug))
            .map(probe_disk)
            .collect())
    }

    async fn unmount(&self, device: &Path, mode: UnmountMode) -> BackendResult<()> {
        let mut mounted: Vec<String> = self
            .all_paths(device)
            .await?
            .into_iter()
            .filter_map(|(_, mountpoint)| mountpoint)
            .filter(|m| !m.is_empty())
            .collect();
        // Innermost first.
        mounted.reverse();

        for target in mounted {
            let mut args = Vec::new();
            match mode {
                UnmountMode::Normal => {}
                UnmountMode::Force => args.push("-f"),
                UnmountMode::Lazy => args.push("-l"),
            }
            args.push(target.as_str());
            self.run("umount", &args).await?;
        }
        Ok(())
    }

    async fn holders(&self, device: &Path) -> BackendResult<Vec<u32>> {
        let paths: Vec<String> = self
            .all_paths(device)
            .await?
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        let args: Vec<&str> = paths.iter().map(String::as_str).collect();

        // fuser prints pids on stdout and everything else on stderr.
        let out = self
            .run_inner("fuser", &args, None, &[0, FUSER_NO_MATCH])
            .await?;
        let mut pids: Vec<u32> = out
            .split_whitespace()
            .filter_map(|tok| tok.trim_end_matches(|c: char| c.is_ascii_alphabetic()).parse().ok())
            .collect();
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }

    async fn kill_holders(&self, device: &Path, signal: KillSignal) -> BackendResult<()> {
        let paths: Vec<String> = self
            .all_paths(device)
            .await?
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        let signal = match signal {
            KillSignal::Term => "-TERM",
            KillSignal::Kill => "-KILL",
        };
        let mut args = vec!["-k", signal];
        args.extend(paths.iter().map(String::as_str));

        self.run_inner("fuser", &args, None, &[0, FUSER_NO_MATCH])
            .await
            .map(|_| ())
    }

    async fn wipe_signatures(&self, device: &Path, force: bool) -> BackendResult<()> {
        let paths = self.all_paths(device).await?;
        let flags = if force { "-af" } else { "-a" };

        // Partitions before the whole device, so their signatures go too.
        for (path, _) in paths.iter().rev() {
            self.run("wipefs", &[flags, path.as_str()]).await?;
        }
        Ok(())
    }

    async fn write_partition_table(&self, device: &Path, reread: bool) -> BackendResult<PathBuf> {
        let dev = path_arg(device);
        self.run("parted", &["-s", &dev, "mklabel", "gpt"]).await?;
        self.run("parted", &["-s", &dev, "mkpart", "primary", "0%", "100%"])
            .await?;

        if reread {
            if let Err(err) = self.run("partprobe", &[&dev]).await {
                debug!("partprobe failed ({err}); trying blockdev");
                self.run("blockdev", &["--rereadpt", &dev]).await?;
            }
        }

        self.tree(device)
            .await?
            .iter()
            .flat_map(|d| d.children.iter())
            .find(|c| c.kind == "part")
            .map(|p| PathBuf::from(&p.path))
            .ok_or_else(|| BackendError::Parse(format!("no partition appeared on {dev}")))
    }

    async fn create_container(&self, partition: &Path, password: &str) -> BackendResult<()> {
        let part = path_arg(partition);
        self.run_inner(
            "cryptsetup",
            &[
                "luksFormat",
                "--type",
                "luks2",
                "--cipher",
                "aes-xts-plain64",
                "--key-size",
                "512",
                "--hash",
                "sha256",
                "--batch-mode",
                "--key-file",
                "-",
                &part,
            ],
            Some(password.as_bytes()),
            &[0],
        )
        .await
        .map(|_| ())
    }

    async fn open_container(
        &self,
        partition: &Path,
        mapper: &str,
        password: &str,
    ) -> BackendResult<PathBuf> {
        let part = path_arg(partition);
        let result = self
            .run_inner(
                "cryptsetup",
                &["open", "--type", "luks", "--key-file", "-", &part, mapper],
                Some(password.as_bytes()),
                &[0],
            )
            .await;

        match result {
            Ok(_) => Ok(mapper_path(mapper)),
            Err(BackendError::Command {
                code: Some(CRYPTSETUP_BAD_PASSPHRASE),
                ..
            }) => Err(BackendError::AuthenticationFailed),
            Err(err) => Err(err),
        }
    }

    async fn close_container(&self, mapper: &str) -> BackendResult<()> {
        self.run("cryptsetup", &["close", mapper]).await.map(|_| ())
    }

    async fn make_filesystem(&self, target: &Path, label: &str, force: bool) -> BackendResult<()> {
        let target = path_arg(target);
        let mut args = Vec::new();
        if force {
            args.push("-F");
        }
        args.extend(["-L", label, target.as_str()]);
        self.run("mkfs.ext4", &args).await.map(|_| ())
    }

    async fn mount(&self, source: &Path, target: &Path) -> BackendResult<()> {
        let target = path_arg(target);
        self.run("mkdir", &["-p", &target]).await?;
        self.run("mount", &[&path_arg(source), &target])
            .await
            .map(|_| ())
    }

    async fn sync(&self) -> BackendResult<()> {
        self.run("sync", &[]).await.map(|_| ())
    }
}
