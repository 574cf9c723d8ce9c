//! Builder: composes the black-box packaging command from a Job's build config.
//!
//! A small registry of packagers keyed by name: `pyinstaller` is the only one
//! shipped, but the Runner calls the registry, never a concrete struct, so a
//! second packager is a registration, not a code change to the Runner.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::job::BuildConfig;

/// Composes a single shell command string for one build; otherwise stateless.
pub trait Packager: Send + Sync {
    /// `workspace_remote` and `output_remote` are absolute remote paths
    /// (`/<tmp>/workspace_<jobId>`, `/<tmp>/output_<jobId>`).
    fn compose(&self, workspace_remote: &str, output_remote: &str, config: &BuildConfig) -> String;
}

pub struct PyInstaller;

impl Packager for PyInstaller {
    fn compose(&self, workspace_remote: &str, output_remote: &str, config: &BuildConfig) -> String {
        let mut args = vec!["pyinstaller".to_string()];

        if config.clean {
            args.push("--clean".to_string());
        }
        if !config.console {
            args.push("--noconsole".to_string());
        }
        if config.onefile {
            args.push("--onefile".to_string());
        } else {
            args.push("--onedir".to_string());
        }
        if let Some(name) = &config.name {
            args.push(format!("--name \"{name}\""));
        }
        if let Some(icon) = &config.icon {
            args.push(format!("--icon \"{icon}\""));
        }
        for (src, dst) in &config.extra_data {
            args.push(format!("--add-data \"{src}:{dst}\""));
        }
        for binary in &config.binaries {
            args.push(format!("--add-binary \"{binary}\""));
        }
        for hidden in &config.hidden_imports {
            args.push(format!("--hidden-import {hidden}"));
        }
        for exclude in &config.excludes {
            args.push(format!("--exclude-module {exclude}"));
        }
        for hook in &config.runtime_hooks {
            args.push(format!("--runtime-hook \"{hook}\""));
        }
        args.extend(config.extra_args.iter().cloned());
        args.push("--noconfirm".to_string());

        let pip_install = match &config.requirements {
            Some(requirements) => format!("pip install -r \"{requirements}\" && "),
            None => String::new(),
        };

        args.push("main_entry_placeholder".to_string());
        let pyinstaller_cmd = args.join(" ");

        format!(
            "cd \"{workspace_remote}\" && {pip_install}{pyinstaller_cmd} && mkdir -p \"{output_remote}\" && cp -r dist/* \"{output_remote}/\""
        )
    }
}

/// Keyed by builder name (`config.builder`, default `pyinstaller`).
pub struct BuilderRegistry {
    packagers: HashMap<String, Arc<dyn Packager>>,
}

impl Default for BuilderRegistry {
    fn default() -> Self {
        let mut packagers: HashMap<String, Arc<dyn Packager>> = HashMap::new();
        packagers.insert("pyinstaller".to_string(), Arc::new(PyInstaller));
        Self { packagers }
    }
}

impl BuilderRegistry {
    pub fn get(&self, name: &str) -> Result<Arc<dyn Packager>> {
        self.packagers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnsupportedBuilder(name.to_string()))
    }
}

/// Substitutes the real entry script path into a composed command, since
/// `Packager::compose` doesn't take it directly (entry script is resolved
/// relative to the workspace by the Runner, which already knows the path).
pub fn with_entry_script(command: &str, entry_script: &str) -> String {
    command.replace("main_entry_placeholder", &format!("\"{entry_script}\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_includes_onefile_flag() {
        let config = BuildConfig {
            builder: "pyinstaller".into(),
            name: Some("hello".into()),
            onefile: true,
            ..Default::default()
        };
        let cmd = PyInstaller.compose("/tmp/workspace_j1", "/tmp/output_j1", &config);
        assert!(cmd.contains("--onefile"));
        assert!(cmd.contains("--name \"hello\""));
        assert!(cmd.contains("cp -r dist/*"));
    }

    #[test]
    fn compose_omits_console_flag_when_consoled() {
        let config = BuildConfig {
            console: true,
            ..Default::default()
        };
        let cmd = PyInstaller.compose("/tmp/w", "/tmp/o", &config);
        assert!(!cmd.contains("--noconsole"));
    }

    #[test]
    fn unsupported_builder_errs() {
        let registry = BuilderRegistry::default();
        assert!(registry.get("nuitka").is_err());
        assert!(registry.get("pyinstaller").is_ok());
    }

    #[test]
    fn entry_script_substitution() {
        let cmd = "pyinstaller main_entry_placeholder --noconfirm";
        let out = with_entry_script(cmd, "app/main.py");
        assert_eq!(out, "pyinstaller \"app/main.py\" --noconfirm");
    }
}
