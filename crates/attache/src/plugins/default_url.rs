//! Default URL plugin
//!
//! Returns a URL built from the `template` option when nothing is attached.
//! `{record_type}`, `{record_id}`, `{name}` and `{version}` are replaced;
//! `{version}` falls back to `original`.

use attache_core::Options;

use crate::attacher::Attacher;
use crate::plugin::{string_option, AttacherLayer, AttacherNext, Plugin, PluginLayers, Target};

pub struct DefaultUrl;

impl Plugin for DefaultUrl {
    fn name(&self) -> &str {
        "default_url"
    }

    fn targets(&self) -> Vec<Target> {
        vec![Target::Attacher]
    }

    fn build(&self, options: &Options) -> Result<PluginLayers, String> {
        let template = string_option(options, "template")
            .filter(|template| !template.is_empty())
            .ok_or("template option is required")?;
        Ok(PluginLayers::new().attacher(DefaultUrlLayer {
            template: template.to_string(),
        }))
    }
}

struct DefaultUrlLayer {
    template: String,
}

impl AttacherLayer for DefaultUrlLayer {
    fn default_url(&self, attacher: &Attacher, options: &Options, _next: AttacherNext<'_>) -> Option<String> {
        let record = attacher.record();
        let version = string_option(options, "version").unwrap_or("original");
        let url = self
            .template
            .replace("{record_type}", &record.record_type.to_lowercase())
            .replace("{record_id}", record.id.as_deref().unwrap_or("new"))
            .replace("{name}", attacher.name())
            .replace("{version}", version);
        Some(url)
    }
}
