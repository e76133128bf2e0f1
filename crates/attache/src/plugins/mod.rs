//! Built-in plugins

pub mod backgrounding;
pub mod default_url;
pub mod determine_mime_type;
pub mod instrumentation;
pub mod pretty_location;
pub mod processing;
pub mod restore_cached_data;
pub mod signature;
pub mod url_options;
pub mod validation;
pub mod versions;

use std::sync::Arc;

use crate::plugin::Plugin;

/// Every plugin shipped with the crate
pub fn builtins() -> Vec<Arc<dyn Plugin>> {
    vec![
        Arc::new(backgrounding::Backgrounding),
        Arc::new(default_url::DefaultUrl),
        Arc::new(determine_mime_type::DetermineMimeType),
        Arc::new(instrumentation::Instrumentation),
        Arc::new(pretty_location::PrettyLocation),
        Arc::new(processing::Processing),
        Arc::new(restore_cached_data::RestoreCachedData),
        Arc::new(signature::Signature),
        Arc::new(url_options::UrlOptions),
        Arc::new(validation::Validation),
        Arc::new(versions::Versions),
    ]
}
