use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

const SEGMENT: &str = "000000010000000000000001";

struct CliFixture {
    _tmp: TempDir,
    store_dir: PathBuf,
    data_dir: PathBuf,
}

impl CliFixture {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let store_dir = tmp.path().join("store");
        let data_dir = tmp.path().join("data");
        std::fs::create_dir_all(&store_dir).unwrap();
        std::fs::create_dir_all(&data_dir).unwrap();

        Self {
            _tmp: tmp,
            store_dir,
            data_dir,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self._tmp.path().join(name)
    }

    fn run(&self, args: &[&str]) -> Output {
        let mut cmd = Command::new(walkeeper_binary_path());
        cmd.arg("--store").arg(&self.store_dir);
        cmd.args(args);
        cmd.env_remove("RUST_LOG");
        cmd.env("WALKEEPER_WAL__PREFETCH_WINDOW", "0");
        cmd.env("WALKEEPER_TRANSFER__MAX_ATTEMPTS", "1");
        cmd.output().unwrap()
    }

    fn run_ok(&self, args: &[&str]) -> String {
        let output = self.run(args);
        if !output.status.success() {
            panic!(
                "command failed: {:?}\nstdout:\n{}\nstderr:\n{}",
                args,
                stdout(&output),
                stderr(&output)
            );
        }
        stdout(&output)
    }

    fn run_code(&self, args: &[&str]) -> i32 {
        self.run(args).status.code().unwrap()
    }

    fn store_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = walkdir::WalkDir::new(&self.store_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                e.path()
                    .strip_prefix(&self.store_dir)
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        keys.sort();
        keys
    }

    /// Write a WAL segment with its archive_status ready marker.
    fn ready_segment(&self, name: &str, contents: &[u8]) -> PathBuf {
        let wal_dir = self.data_dir.join("pg_wal");
        std::fs::create_dir_all(wal_dir.join("archive_status")).unwrap();
        let path = wal_dir.join(name);
        std::fs::write(&path, contents).unwrap();
        std::fs::write(wal_dir.join("archive_status").join(format!("{name}.ready")), b"").unwrap();
        path
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn walkeeper_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_walkeeper"))
}

fn text_segment() -> Vec<u8> {
    (0..10_000)
        .map(|i| format!("line {i}\n"))
        .collect::<String>()
        .into_bytes()
}

fn write_tree(root: &Path) {
    std::fs::create_dir_all(root.join("base/1")).unwrap();
    std::fs::create_dir_all(root.join("pg_wal")).unwrap();
    std::fs::write(root.join("PG_VERSION"), b"16\n").unwrap();
    std::fs::write(root.join("base/1/1259"), vec![7u8; 64 * 1024]).unwrap();
    std::fs::write(root.join("base/1/1249"), b"catalog").unwrap();
    std::fs::write(root.join("pg_wal").join(SEGMENT), b"not backed up").unwrap();
    std::fs::write(root.join("postmaster.pid"), b"4242").unwrap();
}

#[test]
fn wal_push_and_fetch_round_trip() {
    let fx = CliFixture::new();
    let contents = text_segment();
    let segment = fx.ready_segment(SEGMENT, &contents);

    fx.run_ok(&["wal-push", segment.to_str().unwrap()]);

    let dest = fx.path("restore/RECOVERYXLOG");
    std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
    fx.run_ok(&["wal-fetch", SEGMENT, dest.to_str().unwrap()]);
    assert_eq!(std::fs::read(&dest).unwrap(), contents);
}

#[test]
fn wal_push_without_ready_marker_fails() {
    let fx = CliFixture::new();
    let path = fx.data_dir.join(SEGMENT);
    std::fs::write(&path, b"segment").unwrap();

    assert_eq!(fx.run_code(&["wal-push", path.to_str().unwrap()]), 1);
    assert!(fx.store_keys().is_empty());
}

#[test]
fn wal_fetch_missing_segment_exits_one() {
    let fx = CliFixture::new();
    let dest = fx.path("RECOVERYXLOG");

    assert_eq!(
        fx.run_code(&["wal-fetch", SEGMENT, dest.to_str().unwrap()]),
        1
    );
    assert!(!dest.exists());
}

#[test]
fn wal_fetch_rejects_bad_name() {
    let fx = CliFixture::new();
    let dest = fx.path("RECOVERYXLOG");

    assert_eq!(
        fx.run_code(&["wal-fetch", "../escape", dest.to_str().unwrap()]),
        2
    );
}

#[test]
fn wal_prefetch_fills_cache() {
    let fx = CliFixture::new();
    let segment = fx.ready_segment(SEGMENT, b"prefetched");
    fx.run_ok(&["wal-push", segment.to_str().unwrap()]);

    let base = fx.path("replica");
    std::fs::create_dir_all(&base).unwrap();
    let output = Command::new(walkeeper_binary_path())
        .arg("--store")
        .arg(&fx.store_dir)
        .args(["wal-prefetch", base.to_str().unwrap(), SEGMENT])
        .env("WALKEEPER_WAL__PREFETCH_WINDOW", "4")
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", stderr(&output));

    let cached = base.join(".walkeeper/prefetch").join(SEGMENT);
    assert_eq!(std::fs::read(&cached).unwrap(), b"prefetched");

    // A later fetch into the same directory consumes the cached copy
    let dest = base.join("RECOVERYXLOG");
    fx.run_ok(&["wal-fetch", SEGMENT, dest.to_str().unwrap()]);
    assert_eq!(std::fs::read(&dest).unwrap(), b"prefetched");
    assert!(!cached.exists());
}

#[test]
fn wal_prefetch_never_fails() {
    let fx = CliFixture::new();
    let base = fx.path("replica");
    std::fs::create_dir_all(&base).unwrap();

    fx.run_ok(&["wal-prefetch", base.to_str().unwrap(), SEGMENT]);
    fx.run_ok(&["wal-prefetch", base.to_str().unwrap(), "not-a-segment"]);
}

#[test]
fn backup_push_fetch_verify() {
    let fx = CliFixture::new();
    write_tree(&fx.data_dir);

    let backup_id = fx.run_ok(&["backup-push", fx.data_dir.to_str().unwrap()]);
    let backup_id = backup_id.trim();
    assert!(backup_id.starts_with("base_"));

    let listed = fx.run_ok(&["backup-list", "--json"]);
    let listed: serde_json::Value = serde_json::from_str(&listed).unwrap();
    assert_eq!(listed[0]["backup_id"], backup_id);

    let restore = fx.path("restore");
    fx.run_ok(&["backup-fetch", restore.to_str().unwrap(), "LATEST"]);
    assert_eq!(
        std::fs::read(restore.join("base/1/1249")).unwrap(),
        b"catalog"
    );
    assert!(restore.join("pg_wal").is_dir());
    assert!(!restore.join("pg_wal").join(SEGMENT).exists());
    assert!(!restore.join("postmaster.pid").exists());

    fx.run_ok(&["backup-verify", restore.to_str().unwrap()]);
    fx.run_ok(&["backup-verify", "--verify-checksums", restore.to_str().unwrap()]);

    // Same-length corruption is only caught by content checks
    std::fs::write(restore.join("base/1/1249"), b"CATALOG").unwrap();
    fx.run_ok(&["backup-verify", restore.to_str().unwrap()]);
    let output = fx.run(&["backup-verify", "--verify-checksums", restore.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("base/1/1249"));

    std::fs::remove_file(restore.join("PG_VERSION")).unwrap();
    assert_eq!(fx.run_code(&["backup-verify", restore.to_str().unwrap()]), 1);
}

#[test]
fn backup_fetch_unknown_backup_exits_one() {
    let fx = CliFixture::new();
    let restore = fx.path("restore");

    assert_eq!(
        fx.run_code(&["backup-fetch", restore.to_str().unwrap(), "LATEST"]),
        1
    );
    assert_eq!(
        fx.run_code(&[
            "backup-fetch",
            restore.to_str().unwrap(),
            "base_20260101T000000.000Z_abcdef01"
        ]),
        1
    );
}

#[test]
fn delete_requires_confirmation() {
    let fx = CliFixture::new();
    let segment = fx.ready_segment(SEGMENT, b"wal");
    fx.run_ok(&["wal-push", segment.to_str().unwrap()]);
    write_tree(&fx.data_dir);
    fx.run_ok(&["backup-push", fx.data_dir.to_str().unwrap()]);
    let before = fx.store_keys();

    assert_eq!(fx.run_code(&["delete", "everything"]), 2);
    assert_eq!(fx.run_code(&["delete", "retain", "1"]), 2);
    assert_eq!(fx.store_keys(), before);

    fx.run_ok(&["delete", "--confirm", "everything"]);
    assert!(fx.store_keys().is_empty());
    assert_eq!(fx.run_ok(&["backup-list", "--json"]).trim(), "[]");
}

#[test]
fn delete_retain_keeps_newest() {
    let fx = CliFixture::new();
    write_tree(&fx.data_dir);
    let first = fx.run_ok(&["backup-push", fx.data_dir.to_str().unwrap()]);
    let second = fx.run_ok(&["backup-push", fx.data_dir.to_str().unwrap()]);

    fx.run_ok(&["delete", "retain", "1", "--confirm"]);

    let listed = fx.run_ok(&["backup-list"]);
    assert!(!listed.contains(first.trim()));
    assert!(listed.contains(second.trim()));
}
