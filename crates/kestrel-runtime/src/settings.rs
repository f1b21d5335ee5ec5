//! Per-plugin settings sections.

use std::collections::HashMap;

use serde::de::DeserializeOwned;

/// The `plugins.settings` table, shared with every container.
///
/// Plugins resolve it from their service scope and read their own section:
///
/// ```rust,ignore
/// let settings = services.resolve::<PluginSettings>()?;
/// let config: WeatherConfig = settings.section("weather")?.unwrap_or_default();
/// ```
#[derive(Debug, Clone, Default)]
pub struct PluginSettings {
    sections: HashMap<String, serde_json::Value>,
}

impl PluginSettings {
    pub fn new(sections: HashMap<String, serde_json::Value>) -> Self {
        Self { sections }
    }

    pub fn raw(&self, plugin: &str) -> Option<&serde_json::Value> {
        self.sections.get(plugin)
    }

    /// Deserializes the section for `plugin`, if present.
    pub fn section<T: DeserializeOwned>(&self, plugin: &str) -> anyhow::Result<Option<T>> {
        self.sections
            .get(plugin)
            .map(|v| {
                serde_json::from_value(v.clone())
                    .map_err(|e| anyhow::anyhow!("invalid settings for plugin '{plugin}': {e}"))
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Weather {
        api_key: String,
        #[serde(default)]
        units: Option<String>,
    }

    #[test]
    fn test_section_lookup() {
        let settings = PluginSettings::new(HashMap::from([
            ("weather".to_string(), serde_json::json!({ "api_key": "abc" })),
            ("broken".to_string(), serde_json::json!(42)),
        ]));

        let weather: Option<Weather> = settings.section("weather").unwrap();
        assert_eq!(
            weather,
            Some(Weather {
                api_key: "abc".into(),
                units: None
            })
        );
        assert!(settings.section::<Weather>("missing").unwrap().is_none());
        assert!(settings.section::<Weather>("broken").is_err());
    }
}
