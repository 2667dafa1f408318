//! # Localization Module
//!
//! Fluent bundles for every supported language, selected by the Telegram
//! user's `language_code` with English as the fallback.

use anyhow::{anyhow, Result};
use fluent_bundle::concurrent::FluentBundle;
use fluent_bundle::{FluentArgs, FluentResource, FluentValue};
use std::collections::HashMap;
use std::sync::LazyLock;
use unic_langid::LanguageIdentifier;

pub const DEFAULT_LANGUAGE: &str = "en";

// Resources are compiled in so the binaries run from any working directory
const RESOURCES: &[(&str, &str)] = &[
    ("en", include_str!("../locales/en/main.ftl")),
    ("ko", include_str!("../locales/ko/main.ftl")),
];

/// Localization manager holding one bundle per language
pub struct LocalizationManager {
    bundles: HashMap<String, FluentBundle<FluentResource>>,
}

impl LocalizationManager {
    pub fn new() -> Result<Self> {
        let mut bundles = HashMap::new();
        for (code, source) in RESOURCES {
            let locale: LanguageIdentifier = code.parse()?;
            bundles.insert(code.to_string(), Self::create_bundle(locale, source)?);
        }
        Ok(Self { bundles })
    }

    fn create_bundle(
        locale: LanguageIdentifier,
        source: &str,
    ) -> Result<FluentBundle<FluentResource>> {
        let resource = FluentResource::try_new(source.to_string())
            .map_err(|(_, errors)| anyhow!("Invalid resource for {locale}: {errors:?}"))?;

        let mut bundle = FluentBundle::new_concurrent(vec![locale.clone()]);
        // Unicode isolation marks show up as garbage in some Telegram clients
        bundle.set_use_isolating(false);
        bundle
            .add_resource(resource)
            .map_err(|errors| anyhow!("Duplicate messages for {locale}: {errors:?}"))?;
        Ok(bundle)
    }

    pub fn is_language_supported(&self, language: &str) -> bool {
        self.bundles.contains_key(language)
    }

    /// Pick the bundle language for a Telegram language code such as `ko-KR`
    pub fn resolve_language(&self, language_code: Option<&str>) -> String {
        language_code
            .and_then(|code| code.split(['-', '_']).next())
            .map(|code| code.to_lowercase())
            .filter(|code| self.is_language_supported(code))
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string())
    }

    /// Get a localized message, falling back to English
    pub fn get_message_in_language(
        &self,
        key: &str,
        language: &str,
        args: Option<&HashMap<&str, &str>>,
    ) -> String {
        let language = self.resolve_language(Some(language));
        let Some(bundle) = self
            .bundles
            .get(&language)
            .or_else(|| self.bundles.get(DEFAULT_LANGUAGE))
        else {
            return format!("Missing translation: {key}");
        };

        let pattern = match bundle.get_message(key).and_then(|msg| msg.value()) {
            Some(pattern) => pattern,
            None if language != DEFAULT_LANGUAGE => {
                return self.get_message_in_language(key, DEFAULT_LANGUAGE, args);
            }
            None => return format!("Missing translation: {key}"),
        };

        let fluent_args = args.map(|args| {
            let mut fluent_args = FluentArgs::new();
            for (name, value) in args {
                fluent_args.set(*name, FluentValue::from(*value));
            }
            fluent_args
        });

        let mut errors = vec![];
        let value = bundle.format_pattern(pattern, fluent_args.as_ref(), &mut errors);
        if !errors.is_empty() {
            tracing::debug!(key, ?errors, "Localization formatting reported errors");
        }
        value.into_owned()
    }
}

static LOCALIZATION_MANAGER: LazyLock<Option<LocalizationManager>> =
    LazyLock::new(|| match LocalizationManager::new() {
        Ok(manager) => Some(manager),
        Err(e) => {
            tracing::error!(error = %e, "Failed to load localization resources");
            None
        }
    });

/// Load the bundles eagerly so resource errors surface at start-up
pub fn init_localization() -> Result<()> {
    LOCALIZATION_MANAGER
        .as_ref()
        .map(|_| ())
        .ok_or_else(|| anyhow!("Localization resources failed to load"))
}

pub fn get_localization_manager() -> Option<&'static LocalizationManager> {
    LOCALIZATION_MANAGER.as_ref()
}

/// Localized message for a Telegram language code
pub fn t_lang(key: &str, language_code: Option<&str>) -> String {
    t_args_lang(key, &[], language_code)
}

/// Localized message with arguments for a Telegram language code
pub fn t_args_lang(key: &str, args: &[(&str, &str)], language_code: Option<&str>) -> String {
    match get_localization_manager() {
        Some(manager) => {
            let language = manager.resolve_language(language_code);
            let args_map: HashMap<&str, &str> = args.iter().copied().collect();
            let args = (!args_map.is_empty()).then_some(&args_map);
            manager.get_message_in_language(key, &language, args)
        }
        None => key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_language_region_codes() {
        let manager = LocalizationManager::new().unwrap();
        assert_eq!(manager.resolve_language(Some("ko-KR")), "ko");
        assert_eq!(manager.resolve_language(Some("fr")), "en");
        assert_eq!(manager.resolve_language(None), "en");
    }

    #[test]
    fn test_t_args_lang_substitutes() {
        let text = t_args_lang("upload-too-large", &[("max", "50 MB")], Some("en"));
        assert!(text.contains("50 MB"));
    }
}
