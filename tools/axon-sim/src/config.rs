// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Simulator boot file (`[kernel]` table plus `[[boot]]` environments)

use std::fs;
use std::path::Path;

use axon::KernelConfig;
use axon_abi::EnvType;
use serde::Deserialize;

/// Parsed simulator boot file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimConfig {
    #[serde(default)]
    pub kernel: KernelConfig,
    #[serde(default)]
    pub boot: Vec<BootEnv>,
}

/// One environment created before the first trap.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BootEnv {
    pub name: String,
    #[serde(default)]
    pub kind: BootKind,
    #[serde(default = "default_entry")]
    pub entry: u64,
    #[serde(default = "default_stack")]
    pub stack: u64,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BootKind {
    #[default]
    User,
    FsDriver,
    VideoDriver,
}

impl From<BootKind> for EnvType {
    fn from(kind: BootKind) -> Self {
        match kind {
            BootKind::User => EnvType::User,
            BootKind::FsDriver => EnvType::FsDriver,
            BootKind::VideoDriver => EnvType::VideoDriver,
        }
    }
}

fn default_entry() -> u64 {
    0x80_0000
}

fn default_stack() -> u64 {
    0x7000_0000
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("read {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("parse {path}: {source}")]
    Parse { path: String, source: toml::de::Error },
    #[error("{path}: {source}")]
    Kernel { path: String, source: axon::ConfigError },
    #[error("{path}: boot environment name {name:?} is used twice")]
    DuplicateName { path: String, name: String },
}

impl SimConfig {
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let shown = path.display().to_string();
        let text = fs::read_to_string(path).map_err(|source| LoadError::Io { path: shown.clone(), source })?;
        let config: SimConfig =
            toml::from_str(&text).map_err(|source| LoadError::Parse { path: shown.clone(), source })?;
        config.kernel.validate().map_err(|source| LoadError::Kernel { path: shown.clone(), source })?;
        for (index, env) in config.boot.iter().enumerate() {
            if config.boot[..index].iter().any(|prev| prev.name == env.name) {
                return Err(LoadError::DuplicateName { path: shown, name: env.name.clone() });
            }
        }
        Ok(config)
    }

    /// Boot list with at least `count` entries, padding with default user environments.
    pub fn boot_list(&self, count: usize) -> Vec<BootEnv> {
        let mut list = self.boot.clone();
        while list.len() < count {
            list.push(BootEnv {
                name: format!("env{}", list.len()),
                kind: BootKind::User,
                entry: default_entry(),
                stack: default_stack(),
            });
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_kernel_and_boot_tables() {
        let file = write(
            r#"
            [kernel]
            max_envs = 8
            ram_frames = 128

            [[kernel.devices]]
            base = 0xfd000000
            len = 0x1000

            [[boot]]
            name = "vga"
            kind = "video-driver"

            [[boot]]
            name = "app"
            entry = 0x400000
            "#,
        );
        let config = SimConfig::load(file.path()).unwrap();
        assert_eq!(config.kernel.max_envs, 8);
        assert_eq!(config.kernel.devices.len(), 1);
        assert_eq!(config.boot[0].kind, BootKind::VideoDriver);
        assert_eq!(config.boot[1].entry, 0x40_0000);
        assert_eq!(config.boot[1].stack, default_stack());
    }

    #[test]
    fn invalid_kernel_values_are_reported() {
        let file = write("[kernel]\nmax_envs = 0\n");
        assert!(matches!(SimConfig::load(file.path()), Err(LoadError::Kernel { .. })));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let file = write("[[boot]]\nname = \"a\"\n[[boot]]\nname = \"a\"\n");
        assert!(matches!(SimConfig::load(file.path()), Err(LoadError::DuplicateName { .. })));
    }

    #[test]
    fn boot_list_pads_with_user_envs() {
        let config = SimConfig::default();
        let list = config.boot_list(2);
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].name, "env1");
        assert_eq!(list[1].kind, BootKind::User);
    }
}
