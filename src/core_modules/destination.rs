// THEORY:
// Decides, once per run, which file the velocity series goes to. A run either
// writes a fixed local file, or writes onto a removable volume under a name that
// never overwrites an earlier run's file.

use crate::error::{Result, VelocityError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Finds the mount point of a connected removable device.
pub trait VolumeLocator {
    fn removable_mount(&mut self) -> anyhow::Result<Option<PathBuf>>;
}

/// A locator that never finds anything, for machines without removable media.
#[derive(Debug, Default)]
pub struct NoVolumes;

impl VolumeLocator for NoVolumes {
    fn removable_mount(&mut self) -> anyhow::Result<Option<PathBuf>> {
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<BlockDevice>,
}

#[derive(Debug, Deserialize)]
struct BlockDevice {
    name: String,
    /// `true`/`false` on recent util-linux, `"1"`/`"0"` on older releases.
    #[serde(default)]
    rm: serde_json::Value,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    children: Vec<BlockDevice>,
}

impl BlockDevice {
    fn is_removable(&self) -> bool {
        match &self.rm {
            serde_json::Value::Bool(b) => *b,
            serde_json::Value::String(s) => s == "1",
            serde_json::Value::Number(n) => n.as_u64() == Some(1),
            _ => false,
        }
    }
}

/// First mounted filesystem on a removable device in `lsblk -J` output.
/// Partitions inherit the removable flag of their parent disk.
pub fn removable_mount_from_lsblk(json: &str) -> Result<Option<PathBuf>> {
    fn walk(devices: &[BlockDevice], parent_removable: bool) -> Option<PathBuf> {
        devices.iter().find_map(|device| {
            let removable = parent_removable || device.is_removable();
            match &device.mountpoint {
                Some(mount) if removable && !mount.is_empty() => {
                    debug!(device = %device.name, mount = %mount, "removable mount found");
                    Some(PathBuf::from(mount))
                }
                _ => walk(&device.children, removable),
            }
        })
    }

    let output: LsblkOutput = serde_json::from_str(json).map_err(anyhow::Error::from)?;
    Ok(walk(&output.blockdevices, false))
}

/// `VolumeLocator` that asks `lsblk` for mounted removable devices.
#[derive(Debug, Default)]
pub struct LsblkVolumeLocator;

impl VolumeLocator for LsblkVolumeLocator {
    fn removable_mount(&mut self) -> anyhow::Result<Option<PathBuf>> {
        let output = Command::new("lsblk").args(["-J", "-o", "NAME,RM,MOUNTPOINT"]).output()?;
        if !output.status.success() {
            anyhow::bail!("lsblk exited with {}", output.status);
        }
        let json = String::from_utf8(output.stdout)?;
        Ok(removable_mount_from_lsblk(&json)?)
    }
}

/// Where a run's series should be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputTarget {
    /// Always the fixed local file.
    Local,
    /// A removable volume; the run fails without one.
    Removable,
    /// A removable volume when one is mounted, otherwise the local file.
    #[default]
    Auto,
}

/// `dir/base.csv`, or `dir/base_N.csv` with the smallest unused `N >= 1`.
pub fn next_free_path(dir: &Path, base_name: &str) -> PathBuf {
    let first = dir.join(format!("{base_name}.csv"));
    if !first.exists() {
        return first;
    }
    (1u64..)
        .map(|n| dir.join(format!("{base_name}_{n}.csv")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(first)
}

/// Resolves the output file for one run.
pub fn resolve_destination(
    target: OutputTarget,
    local_file: &Path,
    base_name: &str,
    locator: &mut dyn VolumeLocator,
) -> Result<PathBuf> {
    let mount = match target {
        OutputTarget::Local => None,
        OutputTarget::Removable | OutputTarget::Auto => locator.removable_mount()?,
    };

    let path = match (target, mount) {
        (_, Some(mount)) => next_free_path(&mount, base_name),
        (OutputTarget::Removable, None) => return Err(VelocityError::NoRemovableVolume),
        (_, None) => local_file.to_path_buf(),
    };

    info!(path = %path.display(), ?target, "series destination resolved");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct FixedVolume(Option<PathBuf>);

    impl VolumeLocator for FixedVolume {
        fn removable_mount(&mut self) -> anyhow::Result<Option<PathBuf>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn first_free_name_is_the_base_name() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(next_free_path(dir.path(), "output_data"), dir.path().join("output_data.csv"));
    }

    #[test]
    fn existing_files_are_never_reused() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("output_data.csv"), "Frame,Data\n").unwrap();
        assert_eq!(next_free_path(dir.path(), "output_data"), dir.path().join("output_data_1.csv"));

        fs::write(dir.path().join("output_data_1.csv"), "").unwrap();
        fs::write(dir.path().join("output_data_2.csv"), "").unwrap();
        assert_eq!(next_free_path(dir.path(), "output_data"), dir.path().join("output_data_3.csv"));
    }

    #[test]
    fn removable_target_without_volume_is_fatal() {
        let err = resolve_destination(
            OutputTarget::Removable,
            Path::new("output_data.csv"),
            "output_data",
            &mut FixedVolume(None),
        )
        .unwrap_err();
        assert!(matches!(err, VelocityError::NoRemovableVolume));
    }

    #[test]
    fn auto_falls_back_to_local_file() {
        let path = resolve_destination(
            OutputTarget::Auto,
            Path::new("output_data.csv"),
            "output_data",
            &mut NoVolumes,
        )
        .unwrap();
        assert_eq!(path, PathBuf::from("output_data.csv"));
    }

    #[test]
    fn removable_volume_gets_collision_free_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("output_data.csv"), "").unwrap();
        let path = resolve_destination(
            OutputTarget::Auto,
            Path::new("output_data.csv"),
            "output_data",
            &mut FixedVolume(Some(dir.path().to_path_buf())),
        )
        .unwrap();
        assert_eq!(path, dir.path().join("output_data_1.csv"));
    }

    #[test]
    fn local_target_ignores_volumes() {
        let path = resolve_destination(
            OutputTarget::Local,
            Path::new("run.csv"),
            "output_data",
            &mut FixedVolume(Some(PathBuf::from("/media/usb"))),
        )
        .unwrap();
        assert_eq!(path, PathBuf::from("run.csv"));
    }

    #[test]
    fn lsblk_json_with_boolean_flags() {
        let json = r#"{"blockdevices": [
            {"name": "mmcblk0", "rm": false, "mountpoint": null, "children": [
                {"name": "mmcblk0p1", "rm": false, "mountpoint": "/boot"},
                {"name": "mmcblk0p2", "rm": false, "mountpoint": "/"}
            ]},
            {"name": "sda", "rm": true, "mountpoint": null, "children": [
                {"name": "sda1", "rm": false, "mountpoint": "/media/pi/STICK"}
            ]}
        ]}"#;
        assert_eq!(removable_mount_from_lsblk(json).unwrap(), Some(PathBuf::from("/media/pi/STICK")));
    }

    #[test]
    fn lsblk_json_with_string_flags() {
        let json = r#"{"blockdevices": [
            {"name": "sdb", "rm": "1", "mountpoint": "/mnt/usb"}
        ]}"#;
        assert_eq!(removable_mount_from_lsblk(json).unwrap(), Some(PathBuf::from("/mnt/usb")));
    }

    #[test]
    fn unmounted_removable_device_is_ignored() {
        let json = r#"{"blockdevices": [
            {"name": "sdb", "rm": true, "mountpoint": null},
            {"name": "sda", "rm": false, "mountpoint": "/"}
        ]}"#;
        assert_eq!(removable_mount_from_lsblk(json).unwrap(), None);
    }
}
