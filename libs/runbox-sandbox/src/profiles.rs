// Language profile table: image, default commands, and env per language id

use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageProfile {
    pub language: String,
    /// Container image for the isolated backend
    pub image: String,
    pub run_cmd: String,
    pub build_cmd: Option<String>,
    pub env: HashMap<String, String>,
}

impl LanguageProfile {
    fn new(language: &str, image: &str, run_cmd: &str) -> Self {
        Self {
            language: language.to_string(),
            image: image.to_string(),
            run_cmd: run_cmd.to_string(),
            build_cmd: None,
            env: HashMap::new(),
        }
    }

    fn with_build(mut self, build_cmd: &str) -> Self {
        self.build_cmd = Some(build_cmd.to_string());
        self
    }

    fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }
}

/// Read-only lookup from language id to profile
#[derive(Debug, Clone)]
pub struct LanguageProfiles {
    profiles: BTreeMap<String, LanguageProfile>,
}

impl LanguageProfiles {
    pub fn builtin() -> Self {
        let profiles = [
            LanguageProfile::new("python", "python:3.11-slim", "python3 Main.py"),
            LanguageProfile::new("node", "node:20-slim", "node Main.mjs").with_env("NODE_ENV", "production"),
            LanguageProfile::new("go", "golang:1.21-alpine", "go run Main.go").with_env("GOCACHE", "/tmp/go-cache"),
            LanguageProfile::new("rust", "rust:1.74-slim", "./Main").with_build("rustc Main.rs -o Main"),
        ];

        Self {
            profiles: profiles
                .into_iter()
                .map(|profile| (profile.language.clone(), profile))
                .collect(),
        }
    }

    /// Builtin table with per-language image overrides applied. Overrides for
    /// languages not in the table are ignored.
    pub fn with_images(mut self, images: &HashMap<String, String>) -> Self {
        for (language, image) in images {
            if let Some(profile) = self.profiles.get_mut(language) {
                profile.image = image.clone();
            }
        }
        self
    }

    pub fn get(&self, language: &str) -> Option<&LanguageProfile> {
        self.profiles.get(&language.to_lowercase())
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LanguageProfile> {
        self.profiles.values()
    }
}

impl Default for LanguageProfiles {
    fn default() -> Self {
        Self::builtin()
    }
}
