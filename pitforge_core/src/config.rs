use crate::crack::CrackSettings;
use crate::field::FieldOverride;
use crate::mutability::{MutabilityAction, MutabilityRule, Weight};
use crate::value::ValueType;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    #[serde(default = "default_max_array_occurs")]
    pub max_array_occurs: u32,
    #[serde(default = "default_select_default_choices")]
    pub select_default_choices: bool,
    #[serde(default)]
    pub strict_trailing: bool,
}

pub fn default_max_array_occurs() -> u32 {
    65_536
}

fn default_select_default_choices() -> bool {
    true
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_array_occurs: default_max_array_occurs(),
            select_default_choices: default_select_default_choices(),
            strict_trailing: false,
        }
    }
}

impl EngineSettings {
    pub fn crack_settings(&self) -> CrackSettings {
        CrackSettings {
            max_array_occurs: self.max_array_occurs,
            strict_trailing: self.strict_trailing,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PitSettings {
    pub path: PathBuf,
    /// Defaults to the last model declared in the document.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub data_set: Option<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FieldSetting {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub value_type: ValueType,
}

impl From<&FieldSetting> for FieldOverride {
    fn from(setting: &FieldSetting) -> Self {
        FieldOverride::new(&setting.name, &setting.value).with_value_type(setting.value_type)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MutabilitySetting {
    pub action: MutabilityAction,
    pub path: String,
    #[serde(default)]
    pub weight: Option<Weight>,
}

impl From<&MutabilitySetting> for MutabilityRule {
    fn from(setting: &MutabilitySetting) -> Self {
        MutabilityRule {
            action: setting.action,
            path: setting.path.clone(),
            weight: setting.weight,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PitforgeConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub pit: Option<PitSettings>,
    #[serde(default)]
    pub fields: Vec<FieldSetting>,
    #[serde(default)]
    pub mutability: Vec<MutabilitySetting>,
}

impl PitforgeConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: PitforgeConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    pub fn field_overrides(&self) -> Vec<FieldOverride> {
        self.fields.iter().map(FieldOverride::from).collect()
    }

    pub fn mutability_rules(&self) -> Vec<MutabilityRule> {
        self.mutability.iter().map(MutabilityRule::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        let config: PitforgeConfig = toml::from_str("").unwrap();
        assert_eq!(config, PitforgeConfig::default());
        assert_eq!(config.engine.max_array_occurs, 65_536);
        assert!(config.engine.select_default_choices);
        assert!(!config.engine.strict_trailing);
    }

    #[test]
    fn full_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[engine]
max-array-occurs = 16
strict-trailing = true

[pit]
path = "proto.xml"
data-set = "valid"

[[fields]]
name = "header.version"
value = "02"
value-type = "hex"

[[mutability]]
action = "exclude"
path = "header"

[[mutability]]
action = "include"
path = "header.flags"
weight = "above-normal"
"#
        )
        .unwrap();

        let config = PitforgeConfig::load_from_file(&file.path().to_path_buf()).unwrap();
        assert_eq!(config.engine.crack_settings().max_array_occurs, 16);
        assert!(config.engine.crack_settings().strict_trailing);
        let pit = config.pit.as_ref().unwrap();
        assert_eq!(pit.path, PathBuf::from("proto.xml"));
        assert_eq!(pit.model, None);
        assert_eq!(pit.data_set.as_deref(), Some("valid"));
        assert_eq!(
            config.field_overrides(),
            [FieldOverride::new("header.version", "02").with_value_type(ValueType::Hex)]
        );
        let rules = config.mutability_rules();
        assert_eq!(rules[0], MutabilityRule::exclude("header"));
        assert_eq!(rules[1], MutabilityRule::include("header.flags").with_weight(Weight::AboveNormal));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = toml::from_str::<PitforgeConfig>("[engine]\nthreads = 4\n").unwrap_err();
        assert!(err.to_string().contains("unknown field"), "got {err}");

        let missing = PitforgeConfig::load_from_file(&PathBuf::from("/nonexistent/pitforge.toml"));
        assert!(missing.unwrap_err().to_string().contains("Failed to read config file"));
    }
}
