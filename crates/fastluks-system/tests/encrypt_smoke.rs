use fastluks_core::config::FastluksConfig;
use fastluks_core::provider::HostProbe;
use fastluks_core::registry::Registry;
use fastluks_core::workflow::{
    encrypt_and_setup, EncryptOptions, LocalVolume, LocalVolumeStatus, VolumeEncryptor,
};
use fastluks_core::{LuksError, LuksResult};
use fastluks_system::SystemCommandRunner;
use serde_json::Value;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::tempdir;
use zeroize::Zeroizing;

const DEVICE: &str = "/dev/vdz";
const PASSPHRASE: &str = "correct horse battery";

/// One script answers for every tool; it dispatches on the name it was
/// invoked under and keeps the fake host state next to its own directory.
const FAKE_TOOL_SCRIPT: &str = r#"#!/usr/bin/env python3
import json
import os
import sys

HERE = os.path.dirname(os.path.abspath(sys.argv[0]))
STATE = os.path.join(HERE, "..", "state.json")
DEVICE = "/dev/vdz"

try:
    with open(STATE, "r", encoding="utf-8") as fh:
        state = json.load(fh)
except (FileNotFoundError, json.JSONDecodeError):
    state = {}
state.setdefault("luks", None)
state.setdefault("mappings", {})
state.setdefault("mounts", {})
state.setdefault("filesystems", {})
state.setdefault("formats", 0)

def save():
    with open(STATE, "w", encoding="utf-8") as fh:
        json.dump(state, fh)

def fail(code, message):
    print(message, file=sys.stderr)
    sys.exit(code)

tool = os.path.basename(sys.argv[0])
args = sys.argv[1:]

if tool == "lsblk":
    fstype = "crypto_LUKS" if state["luks"] else ""
    print(f"{DEVICE} {fstype}".rstrip())
    for name in state["mappings"]:
        print(f"/dev/mapper/{name} {state['filesystems'].get('/dev/mapper/' + name, '')}".rstrip())
    sys.exit(0)

if tool == "cryptsetup":
    known = ("luksFormat", "luksHeaderBackup", "luksOpen", "luksClose", "status", "luksUUID", "luksDump")
    positions = [i for i, a in enumerate(args) if a in known]
    if not positions:
        fail(1, "no action given")
    verb = args[positions[0]]
    rest = args[positions[0] + 1:]
    if verb == "luksFormat":
        secret = sys.stdin.readline().rstrip("\n")
        state["luks"] = {"secret": secret, "uuid": "6f1d3c2a-0e4b-4b8e-9a57-1c2d3e4f5a6b"}
        state["formats"] += 1
        save()
        sys.exit(0)
    if verb == "luksHeaderBackup":
        target = args[args.index("--header-backup-file") + 1]
        with open(target, "wb") as fh:
            fh.write(b"LUKS\xba\xbe" + b"\x00" * 58)
        sys.exit(0)
    if verb == "luksOpen":
        name = rest[1]
        if state["luks"] is None:
            fail(1, f"Device {DEVICE} is not a valid LUKS device.")
        if name in state["mappings"]:
            fail(5, f"Device {name} already exists.")
        secret = sys.stdin.readline().rstrip("\n")
        if secret != state["luks"]["secret"]:
            fail(2, "No key available with this passphrase.")
        state["mappings"][name] = DEVICE
        save()
        sys.exit(0)
    if verb == "luksClose":
        name = rest[0]
        if state["mappings"].pop(name, None) is None:
            fail(4, f"Device {name} is not active.")
        save()
        sys.exit(0)
    if verb == "status":
        name = rest[0]
        if name in state["mappings"]:
            print(f"/dev/mapper/{name} is active.")
            sys.exit(0)
        fail(4, f"/dev/mapper/{name} is inactive.")
    if verb == "luksUUID":
        if state["luks"] is None:
            fail(1, f"Device {DEVICE} is not a valid LUKS device.")
        print(state["luks"]["uuid"])
        sys.exit(0)
    if verb == "luksDump":
        print("LUKS header information")
        sys.exit(0)
    fail(1, "unexpected args: " + " ".join(args))

if tool == "mkfs":
    fstype, target = args[1], args[2]
    if target[len("/dev/mapper/"):] not in state["mappings"]:
        fail(1, f"The file {target} does not exist.")
    state["filesystems"][target] = fstype
    save()
    sys.exit(0)

if tool == "mount":
    source, target = args[0], args[1]
    if target in state["mounts"]:
        fail(32, f"{target} already mounted")
    state["mounts"][target] = source
    save()
    sys.exit(0)

if tool == "umount":
    if state["mounts"].pop(args[0], None) is None:
        fail(32, f"{args[0]}: not mounted.")
    save()
    sys.exit(0)

if tool == "dd":
    fail(1, "dd: error writing: No space left on device")

if tool in ("df", "dmsetup"):
    print(f"{tool} " + " ".join(args))
    sys.exit(0)

fail(2, f"unknown tool {tool}")
"#;

const TOOLS: &[&str] = &[
    "cryptsetup", "lsblk", "mount", "umount", "mkfs", "dmsetup", "df", "dd",
];

/// Answers host probes from the state the fake tools maintain.
struct StateHost {
    state: PathBuf,
}

impl StateHost {
    fn state(&self) -> Value {
        fs::read_to_string(&self.state)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or(Value::Null)
    }
}

impl HostProbe for StateHost {
    fn is_mount_point(&self, path: &Path) -> bool {
        self.state()["mounts"]
            .get(path.to_string_lossy().as_ref())
            .is_some()
    }

    fn is_block_device(&self, path: &Path) -> bool {
        let path = path.to_string_lossy();
        if path == DEVICE {
            return true;
        }
        path.strip_prefix("/dev/mapper/")
            .map(|name| self.state()["mappings"].get(name).is_some())
            .unwrap_or(false)
    }

    fn distro_id(&self) -> Option<String> {
        None
    }
}

struct Fixture {
    _tmp: tempfile::TempDir,
    config: Arc<FastluksConfig>,
    host: StateHost,
}

impl Fixture {
    fn new() -> LuksResult<Self> {
        let tmp = tempdir()?;
        let bin = tmp.path().join("bin");
        fs::create_dir_all(&bin)?;
        for tool in TOOLS {
            let path = bin.join(tool);
            fs::write(&path, FAKE_TOOL_SCRIPT)?;
            make_executable(&path)?;
        }

        let under = |rel: &str| tmp.path().join(rel).to_string_lossy().into_owned();
        let tool = |name: &str| bin.join(name).to_string_lossy().into_owned();
        let mut config = FastluksConfig::default();
        config.device.device = DEVICE.to_string();
        config.device.cryptdev = Some("securevol".into());
        config.device.mountpoint = under("export");
        config.paths.header_backup_dir = under("luks");
        config.paths.registry = under("luks/luks-cryptdev.toml");
        config.paths.encryption_lock = under("run/encryption.lock");
        config.paths.encryption_success = under("run/encryption.success");
        config.paths.setup_lock = under("run/setup.lock");
        config.paths.setup_success = under("run/setup.success");
        config.binaries.cryptsetup = Some(tool("cryptsetup"));
        config.binaries.lsblk = tool("lsblk");
        config.binaries.mount = tool("mount");
        config.binaries.umount = tool("umount");
        config.binaries.mkfs = tool("mkfs");
        config.binaries.dmsetup = tool("dmsetup");
        config.binaries.df = tool("df");
        config.binaries.dd = tool("dd");
        config.timeout_secs = 30;
        config.paranoid = true;

        let host = StateHost {
            state: tmp.path().join("state.json"),
        };
        Ok(Self {
            _tmp: tmp,
            config: Arc::new(config),
            host,
        })
    }

    fn runner(&self) -> SystemCommandRunner {
        SystemCommandRunner::new(self.config.command_timeout())
    }

    fn encryptor(&self) -> VolumeEncryptor<SystemCommandRunner, &StateHost> {
        VolumeEncryptor::new(Arc::clone(&self.config), self.runner(), &self.host)
    }

    fn options() -> EncryptOptions {
        EncryptOptions {
            passphrase: Some(Zeroizing::new(PASSPHRASE.to_string())),
            confirmation: Some(Zeroizing::new(PASSPHRASE.to_string())),
        }
    }
}

#[test]
fn encrypt_smoke_formats_registers_and_mounts() -> LuksResult<()> {
    let fixture = Fixture::new()?;
    let (encrypted, setup) = encrypt_and_setup(&fixture.encryptor(), Fixture::options())?;

    assert!(!encrypted.already_encrypted);
    assert!(encrypted.mapping_created);
    assert_eq!(encrypted.record.uuid, "6f1d3c2a-0e4b-4b8e-9a57-1c2d3e4f5a6b");
    assert_eq!(encrypted.record.mapper, "/dev/mapper/securevol");
    assert!(setup.events.iter().any(|event| event.message.contains("Mounted")));

    let state = fixture.host.state();
    assert_eq!(state["formats"], 1);
    assert_eq!(state["filesystems"]["/dev/mapper/securevol"], "ext4");
    assert_eq!(
        state["mounts"][fixture.config.device.mountpoint.as_str()],
        "/dev/mapper/securevol"
    );

    let registry = Registry::load(fixture.config.registry_path())?;
    assert_eq!(registry.record()?.device, DEVICE);
    assert!(registry.record()?.passphrase.is_none());
    assert!(fixture.config.header_backup_path().is_file());
    assert_eq!(
        fs::read_to_string(&fixture.config.paths.setup_success)?.trim(),
        "Volume setup completed."
    );
    Ok(())
}

#[test]
fn encrypt_smoke_rerun_keeps_existing_volume() -> LuksResult<()> {
    let fixture = Fixture::new()?;
    encrypt_and_setup(&fixture.encryptor(), Fixture::options())?;

    let runner = fixture.runner();
    let record = Registry::load(fixture.config.registry_path())?.record()?.clone();
    let volume = LocalVolume::new(Arc::clone(&fixture.config), record, &runner, &fixture.host);
    assert_eq!(volume.close()?, LocalVolumeStatus::Unmounted);

    let (encrypted, _) = encrypt_and_setup(&fixture.encryptor(), Fixture::options())?;
    assert!(encrypted.already_encrypted);
    assert!(encrypted.mapping_created);

    let state = fixture.host.state();
    assert_eq!(state["formats"], 1);
    assert_eq!(volume.status(), LocalVolumeStatus::Mounted);
    Ok(())
}

#[test]
fn local_volume_round_trip_through_real_processes() -> LuksResult<()> {
    let fixture = Fixture::new()?;
    let (encrypted, _) = encrypt_and_setup(&fixture.encryptor(), Fixture::options())?;

    let runner = fixture.runner();
    let volume = LocalVolume::new(
        Arc::clone(&fixture.config),
        encrypted.record,
        &runner,
        &fixture.host,
    );
    assert_eq!(volume.status(), LocalVolumeStatus::Mounted);
    assert_eq!(volume.close()?, LocalVolumeStatus::Unmounted);

    let err = volume.open("not the passphrase").unwrap_err();
    assert!(matches!(err, LuksError::BadPassphrase));
    assert_eq!(volume.status(), LocalVolumeStatus::Unmounted);

    assert_eq!(volume.open(PASSPHRASE)?, LocalVolumeStatus::Mounted);
    Ok(())
}

fn make_executable(path: &Path) -> std::io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)
}
