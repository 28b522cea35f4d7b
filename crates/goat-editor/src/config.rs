// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use clap::ValueEnum;
use goat_render::{RenderSettings, RenderSize};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Gl,
    #[default]
    Vk,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct WindowCfg {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowCfg {
    fn default() -> Self {
        Self {
            title: "GOAT editor".into(),
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RenderCfg {
    pub backend: Backend,
    pub clear_color: [f32; 4],
    pub vsync: bool,
    pub frames_in_flight: usize,
    pub shader_dir: Option<PathBuf>,
}

impl Default for RenderCfg {
    fn default() -> Self {
        let settings = RenderSettings::default();
        Self {
            backend: Backend::default(),
            clear_color: settings.clear_color,
            vsync: settings.vsync,
            frames_in_flight: settings.frames_in_flight,
            shader_dir: None,
        }
    }
}

impl RenderCfg {
    pub fn settings(&self) -> RenderSettings {
        RenderSettings {
            clear_color: self.clear_color,
            vsync: self.vsync,
            frames_in_flight: self.frames_in_flight.max(1),
            shader_dir: self.shader_dir.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
#[serde(default)]
pub struct AppCfg {
    pub window: WindowCfg,
    pub render: RenderCfg,
}

impl AppCfg {
    pub fn window_size(&self) -> RenderSize {
        RenderSize::new(self.window.width, self.window.height)
    }
}

pub fn parse_cfg(text: &str) -> Result<AppCfg> {
    toml::from_str(text).context("parsing config")
}

/// Missing files give the defaults; so do malformed ones, with a warning.
pub fn load_cfg(path: &Path) -> AppCfg {
    let text = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => {
            info!("no config at {}, using defaults", path.display());
            return AppCfg::default();
        }
    };
    match parse_cfg(&text) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("{}: {e:#}; using defaults", path.display());
            AppCfg::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_is_all_defaults() {
        assert_eq!(parse_cfg("").unwrap(), AppCfg::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = parse_cfg(
            r#"
            [render]
            backend = "gl"
            vsync = false

            [window]
            width = 640
            "#,
        )
        .unwrap();
        assert_eq!(cfg.render.backend, Backend::Gl);
        assert!(!cfg.render.vsync);
        assert_eq!(cfg.render.frames_in_flight, 2);
        assert_eq!(cfg.window.width, 640);
        assert_eq!(cfg.window.height, 720);
        assert_eq!(cfg.window.title, "GOAT editor");
    }

    #[test]
    fn settings_carry_render_fields() {
        let cfg = parse_cfg(
            r#"
            [render]
            clear_color = [0.0, 0.5, 1.0, 1.0]
            frames_in_flight = 0
            shader_dir = "shaders"
            "#,
        )
        .unwrap();
        let s = cfg.render.settings();
        assert_eq!(s.clear_color, [0.0, 0.5, 1.0, 1.0]);
        assert_eq!(s.frames_in_flight, 1);
        assert_eq!(s.shader_dir, Some(PathBuf::from("shaders")));
    }

    #[test]
    fn unknown_backend_is_an_error() {
        assert!(parse_cfg("[render]\nbackend = \"dx12\"\n").is_err());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_cfg(&dir.path().join("goat.toml"));
        assert_eq!(cfg, AppCfg::default());
    }

    #[test]
    fn malformed_file_loads_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[render\nvsync = maybe").unwrap();
        assert_eq!(load_cfg(f.path()), AppCfg::default());
    }

    #[test]
    fn file_on_disk_is_parsed() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[window]\ntitle = \"scratch\"").unwrap();
        assert_eq!(load_cfg(f.path()).window.title, "scratch");
    }
}
