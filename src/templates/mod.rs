//! Path templates for the artifact tree.
//!
//! Three templates map `(platform, old hash, new hash, binary name,
//! encryption flag)` to relative paths: one for the manifest, one for a
//! binary delta, one for the full blob. The same templates drive both the
//! publisher (filesystem paths under the output root) and the consumer
//! (URL paths under the base URL), so the two sides agree by construction.

use serde::Serialize;
use tera::{Context, Tera};
use thiserror::Error;

use crate::types::Platform;

pub const DEFAULT_MANIFEST_TEMPLATE: &str = "{{ os_tag }}_{{ arch_tag }}.json";
pub const DEFAULT_DIFF_TEMPLATE: &str =
    "{{ os_tag }}_{{ arch_tag }}/{{ old_hash }}/{{ new_hash }}{% if is_encrypted %}.gpg{% endif %}";
pub const DEFAULT_BLOB_TEMPLATE: &str =
    "{{ os_tag }}_{{ arch_tag }}/{{ new_hash }}.gz{% if is_encrypted %}.gpg{% endif %}";

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("failed to parse {kind} template: {source}")]
    Parse {
        kind: TemplateKind,
        #[source]
        source: tera::Error,
    },

    #[error("failed to render {kind} template: {source}")]
    Render {
        kind: TemplateKind,
        #[source]
        source: tera::Error,
    },

    #[error("{kind} template rendered an empty path")]
    EmptyRender { kind: TemplateKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Manifest,
    Diff,
    Blob,
}

impl TemplateKind {
    fn name(self) -> &'static str {
        match self {
            TemplateKind::Manifest => "manifest",
            TemplateKind::Diff => "diff",
            TemplateKind::Blob => "blob",
        }
    }
}

impl std::fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Render context fed to every template. The hash fields may be empty,
/// which is how the manifest path is reached.
#[derive(Debug, Clone, Serialize)]
pub struct UrlInfo {
    pub os_tag: String,
    pub arch_tag: String,
    pub old_hash: String,
    pub new_hash: String,
    pub binary_name: String,
    pub is_encrypted: bool,
}

impl UrlInfo {
    pub fn new(platform: &Platform, is_encrypted: bool) -> Self {
        Self {
            os_tag: platform.os_tag.clone(),
            arch_tag: platform.arch_tag.clone(),
            old_hash: String::new(),
            new_hash: String::new(),
            binary_name: String::new(),
            is_encrypted,
        }
    }
}

/// The three compiled path templates.
pub struct TemplateSet {
    tera: Tera,
}

impl TemplateSet {
    /// Compile the given template strings. An empty string selects the
    /// default for that slot; a template that fails to parse is an error.
    pub fn new(manifest: &str, diff: &str, blob: &str) -> Result<Self, TemplateError> {
        let mut tera = Tera::default();
        let slots = [
            (TemplateKind::Manifest, manifest, DEFAULT_MANIFEST_TEMPLATE),
            (TemplateKind::Diff, diff, DEFAULT_DIFF_TEMPLATE),
            (TemplateKind::Blob, blob, DEFAULT_BLOB_TEMPLATE),
        ];
        for (kind, template, default) in slots {
            let template = if template.is_empty() { default } else { template };
            tera.add_raw_template(kind.name(), template)
                .map_err(|source| TemplateError::Parse { kind, source })?;
        }
        Ok(Self { tera })
    }

    /// The default layout: `{os}_{arch}.json`, `{os}_{arch}/{old}/{new}` and
    /// `{os}_{arch}/{new}.gz`, with a `.gpg` suffix on encrypted payloads.
    pub fn defaults() -> Self {
        Self::new("", "", "").expect("default templates parse")
    }

    /// Render one path. Referencing an undefined variable or rendering an
    /// empty string is an error.
    pub fn render(&self, kind: TemplateKind, info: &UrlInfo) -> Result<String, TemplateError> {
        let context =
            Context::from_serialize(info).map_err(|source| TemplateError::Render { kind, source })?;
        let path = self
            .tera
            .render(kind.name(), &context)
            .map_err(|source| TemplateError::Render { kind, source })?;
        if path.is_empty() {
            return Err(TemplateError::EmptyRender { kind });
        }
        Ok(path)
    }
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self::defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> UrlInfo {
        UrlInfo {
            os_tag: "linux".into(),
            arch_tag: "amd64".into(),
            old_hash: "oldsha".into(),
            new_hash: "newsha".into(),
            binary_name: "mybin".into(),
            is_encrypted: false,
        }
    }

    #[test]
    fn default_paths() {
        let templates = TemplateSet::defaults();
        let info = info();
        assert_eq!(
            templates.render(TemplateKind::Manifest, &info).unwrap(),
            "linux_amd64.json"
        );
        assert_eq!(
            templates.render(TemplateKind::Diff, &info).unwrap(),
            "linux_amd64/oldsha/newsha"
        );
        assert_eq!(
            templates.render(TemplateKind::Blob, &info).unwrap(),
            "linux_amd64/newsha.gz"
        );
    }

    #[test]
    fn encrypted_paths_get_gpg_suffix() {
        let templates = TemplateSet::defaults();
        let mut info = info();
        info.is_encrypted = true;
        assert_eq!(
            templates.render(TemplateKind::Diff, &info).unwrap(),
            "linux_amd64/oldsha/newsha.gpg"
        );
        assert_eq!(
            templates.render(TemplateKind::Blob, &info).unwrap(),
            "linux_amd64/newsha.gz.gpg"
        );
        assert_eq!(
            templates.render(TemplateKind::Manifest, &info).unwrap(),
            "linux_amd64.json"
        );
    }

    #[test]
    fn empty_hashes_reach_the_manifest_path() {
        let templates = TemplateSet::defaults();
        let info = UrlInfo::new(&Platform::new("linux", "amd64"), false);
        assert_eq!(
            templates.render(TemplateKind::Manifest, &info).unwrap(),
            "linux_amd64.json"
        );
    }

    #[test]
    fn empty_template_string_selects_default() {
        let templates = TemplateSet::new("", "custom/{{ new_hash }}", "").unwrap();
        let info = info();
        assert_eq!(
            templates.render(TemplateKind::Manifest, &info).unwrap(),
            "linux_amd64.json"
        );
        assert_eq!(
            templates.render(TemplateKind::Diff, &info).unwrap(),
            "custom/newsha"
        );
    }

    #[test]
    fn unknown_variable_is_an_error() {
        let templates = TemplateSet::new("{{ nonsense }}", "", "").unwrap();
        let err = templates.render(TemplateKind::Manifest, &info()).unwrap_err();
        assert!(matches!(
            err,
            TemplateError::Render {
                kind: TemplateKind::Manifest,
                ..
            }
        ));
    }

    #[test]
    fn empty_render_is_an_error() {
        let templates = TemplateSet::new("{{ old_hash }}", "", "").unwrap();
        let mut info = info();
        info.old_hash.clear();
        let err = templates.render(TemplateKind::Manifest, &info).unwrap_err();
        assert!(matches!(err, TemplateError::EmptyRender { .. }));
    }

    #[test]
    fn parse_error_surfaces() {
        assert!(matches!(
            TemplateSet::new("{% if %}", "", ""),
            Err(TemplateError::Parse {
                kind: TemplateKind::Manifest,
                ..
            })
        ));
    }
}
