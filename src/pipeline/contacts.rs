//! # Contact Directory
//!
//! Maps caller phone numbers to a greeting that plays as soon as their stream
//! starts. Loaded once at startup from a TOML file:
//!
//! ```toml
//! [[contact]]
//! phone = "+1 (555) 010-2000"
//! name = "Ada"
//! greeting_wav = "greetings/ada.wav"   # relative to this file
//!
//! [[contact]]
//! phone = "+44 20 7946 0000"
//! greeting = "//////////8="            # base64 μ-law at the wire rate
//! ```
//!
//! WAV greetings are converted to wire μ-law while loading, so lookups during
//! a call are a plain map read.

use super::ContactLookup;
use crate::audio::{wav, AudioProcessor, AudioSettings};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Strip a phone number down to digits, keeping a leading `+`.
///
/// `"+1 (555) 010-2000"` and `"+15550102000"` normalize to the same key.
pub fn normalize_phone_number(raw: &str) -> String {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return String::new();
    }
    if trimmed.starts_with('+') {
        format!("+{}", digits)
    } else {
        digits
    }
}

#[derive(Debug, Deserialize)]
struct ContactFile {
    #[serde(default, rename = "contact")]
    contacts: Vec<ContactEntry>,
}

#[derive(Debug, Deserialize)]
struct ContactEntry {
    phone: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    greeting: Option<String>,
    #[serde(default)]
    greeting_wav: Option<String>,
}

/// One known caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub name: Option<String>,
    /// Base64 μ-law, ready to drop into a `media` event
    pub greeting: Option<String>,
}

/// Phone number → contact map.
#[derive(Debug, Default)]
pub struct ContactDirectory {
    entries: HashMap<String, Contact>,
}

impl ContactDirectory {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load from a TOML file. An empty path yields an empty directory.
    pub fn load(path: &str, settings: &AudioSettings) -> Result<Self> {
        if path.trim().is_empty() {
            tracing::info!("No contact directory configured");
            return Ok(Self::empty());
        }

        let path = Path::new(path);
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read contact directory {}", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

        let directory = Self::from_toml(&text, base_dir, settings)?;
        if directory.is_empty() {
            tracing::warn!(path = %path.display(), "Contact directory has no entries");
        }
        tracing::info!(
            path = %path.display(),
            contacts = directory.len(),
            "Contact directory loaded"
        );
        Ok(directory)
    }

    /// Parse TOML text; `greeting_wav` paths resolve against `base_dir`.
    pub fn from_toml(text: &str, base_dir: &Path, settings: &AudioSettings) -> Result<Self> {
        let file: ContactFile = toml::from_str(text).context("Contact directory is not valid TOML")?;
        let processor = AudioProcessor::new(settings.clone());

        let mut entries = HashMap::new();
        for entry in file.contacts {
            let key = normalize_phone_number(&entry.phone);
            if key.is_empty() {
                return Err(anyhow!("Contact has no digits in phone number {:?}", entry.phone));
            }

            let greeting = match (entry.greeting, entry.greeting_wav) {
                (Some(_), Some(_)) => {
                    return Err(anyhow!("Contact {} sets both greeting and greeting_wav", key));
                }
                (Some(encoded), None) => {
                    let bytes = STANDARD
                        .decode(encoded.trim())
                        .with_context(|| format!("Greeting for {} is not valid base64", key))?;
                    Some(STANDARD.encode(bytes))
                }
                (None, Some(wav_path)) => {
                    let full_path = base_dir.join(&wav_path);
                    let bytes = std::fs::read(&full_path)
                        .with_context(|| format!("Failed to read greeting {}", full_path.display()))?;
                    let decoded = wav::read_wav(&bytes)
                        .with_context(|| format!("Greeting {} is not a readable WAV file", full_path.display()))?;
                    let wire = processor.speech_to_wire(&decoded.samples, decoded.sample_rate);
                    Some(STANDARD.encode(wire))
                }
                (None, None) => None,
            };

            if entries
                .insert(key.clone(), Contact { name: entry.name, greeting })
                .is_some()
            {
                tracing::warn!(phone = %key, "Duplicate contact, keeping the last entry");
            }
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, phone: &str) -> Option<&Contact> {
        self.entries.get(&normalize_phone_number(phone))
    }
}

impl ContactLookup for ContactDirectory {
    fn greeting_for(&self, phone: &str) -> Option<String> {
        let contact = self.get(phone)?;
        tracing::debug!(phone, name = contact.name.as_deref().unwrap_or("unnamed"), "Known caller");
        contact.greeting.clone()
    }
}
