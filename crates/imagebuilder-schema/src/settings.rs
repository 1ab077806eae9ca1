use serde::{Deserialize, Serialize};

/// Settings of one config package: named sections of named parameters.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub sections: Vec<Section>,
}

impl Settings {
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Section {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<SettingsParameter>,
}

impl Section {
    pub fn parameter(&self, name: &str) -> Option<&SettingsParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SettingsParameter {
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub must_override: bool,
    #[serde(default)]
    pub is_encrypted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_flags() {
        let input = r#"
[[sections]]
name = "Db"

[[sections.parameters]]
name = "ConnectionString"
value = "server=local"

[[sections.parameters]]
name = "Password"
must_override = true
is_encrypted = true
"#;
        let s: Settings = toml::from_str(input).unwrap();
        let db = s.section("Db").unwrap();
        assert_eq!(db.parameters.len(), 2);
        let pw = db.parameter("Password").unwrap();
        assert!(pw.must_override && pw.is_encrypted);
        assert!(pw.value.is_empty());
        assert!(s.section("Missing").is_none());
    }

    #[test]
    fn empty_settings_document_is_valid() {
        let s: Settings = toml::from_str("").unwrap();
        assert!(s.sections.is_empty());
    }
}
