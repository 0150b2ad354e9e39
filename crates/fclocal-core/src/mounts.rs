//! Mount planning.
//!
//! A [`MountPlan`] is computed once per lifecycle `init` and always has the
//! same shape: the code mount at `/code` first, then one mount per storage
//! mapping, then the optional `/tmp` and debugger mounts.

use crate::config::{DebugConfig, LocalSettings, NasConfig, NasMountPoint};
use crate::error::{CoreError, Result};
use fclocal_docker::MountSpec;
use regex::Regex;
use std::fs::File;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Where function code is mounted in the sandbox.
pub const CODE_MOUNT_TARGET: &str = "/code";

/// Mount directory of automatically provisioned storage.
pub const AUTO_NAS_MOUNT_DIR: &str = "/mnt/auto";

/// Where the requested temp directory is mounted.
pub const TMP_MOUNT_TARGET: &str = "/tmp";

/// Where debugger binaries are mounted.
pub const DEBUGGER_MOUNT_TARGET: &str = "/tmp/debugger_files";

const NAS_SERVER_ADDR_PATTERN: &str = r"^[a-z0-9.-]*\.nas\.[a-z]+\.com:/";

/// Archive extensions that are unpacked before mounting.
const ARCHIVE_EXTENSIONS: [&str; 3] = ["zip", "jar", "war"];

/// Access mode of the code mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeAccess {
    /// Invocations never write to their code.
    ReadOnly,
    /// Build steps write artifacts back into the code directory.
    ReadWrite,
}

/// A local directory standing in for a storage mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NasMapping {
    /// Host directory.
    pub local_dir: PathBuf,
    /// Mount directory inside the sandbox.
    pub remote_dir: String,
}

/// Code ready to be mounted.
///
/// When the code was an archive, it is unpacked into a private temp directory
/// that lives as long as this value.
#[derive(Debug)]
pub struct CodeSource {
    dir: PathBuf,
    extracted: Option<TempDir>,
}

impl CodeSource {
    /// Directory mounted at `/code`.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether the directory is a temporary extraction.
    pub fn is_extracted(&self) -> bool {
        self.extracted.is_some()
    }

    /// Remove the extracted directory, if any.
    pub fn release(&mut self) -> Result<()> {
        if let Some(dir) = self.extracted.take() {
            let path = dir.path().to_path_buf();
            dir.close()?;
            tracing::debug!(path = %path.display(), "Removed extracted code directory");
        }
        Ok(())
    }
}

/// Resolve `code_uri` into a directory to mount at `/code`.
///
/// Directories are used as-is, archives are unpacked into a temp directory,
/// and a single file is served from its parent directory.
pub async fn prepare_code(code_uri: &Path) -> Result<CodeSource> {
    let meta = tokio::fs::metadata(code_uri).await.map_err(|e| {
        CoreError::MountResolution(format!("code path {}: {e}", code_uri.display()))
    })?;

    if meta.is_dir() {
        return Ok(CodeSource {
            dir: code_uri.to_path_buf(),
            extracted: None,
        });
    }

    if is_archive(code_uri) {
        let archive = code_uri.to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || extract_archive(&archive))
            .await
            .map_err(|e| CoreError::MountResolution(format!("extraction task failed: {e}")))??;
        tracing::info!(
            archive = %code_uri.display(),
            dir = %extracted.path().display(),
            "Extracted code archive"
        );
        return Ok(CodeSource {
            dir: extracted.path().to_path_buf(),
            extracted: Some(extracted),
        });
    }

    let parent = code_uri.parent().ok_or_else(|| {
        CoreError::MountResolution(format!("code file has no parent: {}", code_uri.display()))
    })?;
    Ok(CodeSource {
        dir: parent.to_path_buf(),
        extracted: None,
    })
}

fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| ARCHIVE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn extract_archive(archive: &Path) -> Result<TempDir> {
    let mount_err = |e: &dyn std::fmt::Display| {
        CoreError::MountResolution(format!("archive {}: {e}", archive.display()))
    };
    let dir = tempfile::Builder::new().prefix("fclocal-code-").tempdir()?;
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| mount_err(&e))?;
    zip.extract(dir.path()).map_err(|e| mount_err(&e))?;
    Ok(dir)
}

/// Map a storage config onto local directories under `nas_base_dir`.
///
/// `Auto` always yields exactly one mapping, to `/mnt/auto`.
pub fn nas_mappings(nas: &NasConfig, nas_base_dir: &Path, service_name: &str) -> Result<Vec<NasMapping>> {
    match nas {
        NasConfig::Auto => Ok(vec![NasMapping {
            local_dir: nas_base_dir.join("auto-default").join(service_name),
            remote_dir: AUTO_NAS_MOUNT_DIR.to_string(),
        }]),
        NasConfig::Explicit { mount_points, .. } => {
            let pattern = Regex::new(NAS_SERVER_ADDR_PATTERN)
                .map_err(|e| CoreError::Config(e.to_string()))?;
            mount_points
                .iter()
                .map(|mp| nas_mapping(&pattern, mp, nas_base_dir))
                .collect()
        }
    }
}

fn nas_mapping(pattern: &Regex, mp: &NasMountPoint, nas_base_dir: &Path) -> Result<NasMapping> {
    if !pattern.is_match(&mp.server_addr) {
        return Err(CoreError::MountResolution(format!(
            "NasConfig's nas server address '{}' doesn't match expected format (allowed: '{}')",
            mp.server_addr, NAS_SERVER_ADDR_PATTERN
        )));
    }
    // the pattern guarantees a ':/' separator
    let (host, remote_path) = mp.server_addr.split_once(':').unwrap_or_default();
    Ok(NasMapping {
        local_dir: nas_base_dir.join(host).join(remote_path.trim_start_matches('/')),
        remote_dir: mp.mount_dir.clone(),
    })
}

/// Rewrite a Windows host path into the form seen by the Docker Toolbox VM.
///
/// `C:\Users\me\code` becomes `/c/Users/me/code`.
pub fn to_virtualbox_path(source: &str) -> String {
    let joined: String = source.split(':').collect();
    let slashed = joined.replace('\\', "/");
    let mut chars = slashed.chars();
    match chars.next() {
        Some(first) => format!("/{}{}", first.to_lowercase(), chars.as_str()),
        None => "/".to_string(),
    }
}

/// Ordered bind mounts for one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPlan {
    mounts: Vec<MountSpec>,
}

impl MountPlan {
    /// Build the plan. Local storage directories are created if missing.
    pub fn build(
        code: &CodeSource,
        access: CodeAccess,
        nas: &[NasMapping],
        settings: &LocalSettings,
        debug: &DebugConfig,
    ) -> Result<Self> {
        let mut mounts = Vec::with_capacity(nas.len() + 3);

        mounts.push(
            MountSpec::bind(code.dir(), CODE_MOUNT_TARGET)
                .read_only(access == CodeAccess::ReadOnly),
        );

        for mapping in nas {
            std::fs::create_dir_all(&mapping.local_dir).map_err(|e| {
                CoreError::MountResolution(format!(
                    "local nas dir {}: {e}",
                    mapping.local_dir.display()
                ))
            })?;
            let local = mapping.local_dir.canonicalize()?;
            mounts.push(MountSpec::bind(local, mapping.remote_dir.clone()));
        }

        if let Some(tmp) = &settings.tmp_dir {
            std::fs::create_dir_all(tmp)?;
            mounts.push(MountSpec::bind(tmp.canonicalize()?, TMP_MOUNT_TARGET));
        }

        if let Some(debugger) = &debug.debugger_path {
            let path = debugger.canonicalize().map_err(|e| {
                CoreError::MountResolution(format!("debugger path {}: {e}", debugger.display()))
            })?;
            mounts.push(MountSpec::bind(path, DEBUGGER_MOUNT_TARGET));
        }

        if settings.docker_toolbox {
            tracing::warn!("Docker Toolbox detected, rewriting mount paths for the VirtualBox VM");
            for mount in &mut mounts {
                mount.source = PathBuf::from(to_virtualbox_path(&mount.source.to_string_lossy()));
            }
        }

        Ok(Self { mounts })
    }

    /// All mounts, in order.
    pub fn mounts(&self) -> &[MountSpec] {
        &self.mounts
    }

    /// The code mount (always first).
    pub fn code_mount(&self) -> Option<&MountSpec> {
        self.mounts.first().filter(|m| m.target == CODE_MOUNT_TARGET)
    }

    /// Number of mounts targeting `/code`.
    pub fn code_mount_count(&self) -> usize {
        self.mounts
            .iter()
            .filter(|m| m.target == CODE_MOUNT_TARGET)
            .count()
    }

    /// Number of mounts.
    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    /// Whether the plan has no mounts.
    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn explicit(addrs: &[(&str, &str)]) -> NasConfig {
        NasConfig::Explicit {
            user_id: Some(10003),
            group_id: Some(10003),
            mount_points: addrs
                .iter()
                .map(|(addr, dir)| NasMountPoint {
                    server_addr: addr.to_string(),
                    mount_dir: dir.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_auto_nas_single_mapping() {
        let mappings = nas_mappings(&NasConfig::Auto, Path::new("/base/nas"), "svc").unwrap();
        assert_eq!(
            mappings,
            vec![NasMapping {
                local_dir: PathBuf::from("/base/nas/auto-default/svc"),
                remote_dir: "/mnt/auto".into(),
            }]
        );
    }

    #[test]
    fn test_explicit_nas_mapping() {
        let nas = explicit(&[
            ("abc-123.cn-hangzhou.nas.aliyuncs.com:/share", "/mnt/a"),
            ("xyz.cn-shanghai.nas.aliyuncs.com:/", "/mnt/b"),
        ]);
        let mappings = nas_mappings(&nas, Path::new("/base"), "svc").unwrap();
        assert_eq!(mappings.len(), 2);
        assert_eq!(
            mappings[0].local_dir,
            PathBuf::from("/base/abc-123.cn-hangzhou.nas.aliyuncs.com/share")
        );
        assert_eq!(mappings[1].remote_dir, "/mnt/b");
    }

    #[test]
    fn test_malformed_nas_address() {
        let nas = explicit(&[("fileserver.local:/share", "/mnt/a")]);
        let err = nas_mappings(&nas, Path::new("/base"), "svc").unwrap_err();
        assert!(matches!(err, CoreError::MountResolution(_)));
        assert!(err.to_string().contains("doesn't match expected format"));
    }

    #[test]
    fn test_virtualbox_path() {
        assert_eq!(
            to_virtualbox_path(r"C:\Users\image_crawler\code"),
            "/c/Users/image_crawler/code"
        );
    }

    #[tokio::test]
    async fn test_plan_order_and_single_code_mount() {
        let code_dir = tempfile::tempdir().unwrap();
        let nas_dir = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let code = prepare_code(code_dir.path()).await.unwrap();
        let mappings = nas_mappings(&NasConfig::Auto, nas_dir.path(), "svc").unwrap();
        let settings = LocalSettings {
            tmp_dir: Some(tmp.path().to_path_buf()),
            ..LocalSettings::default()
        };

        let plan = MountPlan::build(
            &code,
            CodeAccess::ReadOnly,
            &mappings,
            &settings,
            &DebugConfig::default(),
        )
        .unwrap();

        let targets: Vec<_> = plan.mounts().iter().map(|m| m.target.as_str()).collect();
        assert_eq!(targets, vec!["/code", "/mnt/auto", "/tmp"]);
        assert_eq!(plan.code_mount_count(), 1);
        assert!(plan.code_mount().unwrap().read_only);
        assert!(nas_dir.path().join("auto-default/svc").is_dir());
    }

    #[tokio::test]
    async fn test_single_file_mounts_parent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("index.js");
        std::fs::write(&file, "exports.handler = () => {}").unwrap();
        let code = prepare_code(&file).await.unwrap();
        assert_eq!(code.dir(), dir.path());
        assert!(!code.is_extracted());
    }

    #[tokio::test]
    async fn test_archive_extracted_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("code.zip");
        {
            let mut zip = zip::ZipWriter::new(File::create(&archive).unwrap());
            zip.start_file("index.js", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"exports.handler = () => {}").unwrap();
            zip.finish().unwrap();
        }

        let mut code = prepare_code(&archive).await.unwrap();
        assert!(code.is_extracted());
        let extracted = code.dir().to_path_buf();
        assert!(extracted.join("index.js").is_file());

        code.release().unwrap();
        assert!(!extracted.exists());
    }

    #[tokio::test]
    async fn test_missing_code_path() {
        let err = prepare_code(Path::new("/definitely/not/here")).await.unwrap_err();
        assert!(matches!(err, CoreError::MountResolution(_)));
    }
}
