//! API endpoint URL builders

/// Build batch collection URL
pub fn batches_url(base_url: &str) -> String {
    format!("{}/batches", base_url.trim_end_matches('/'))
}

/// Build batch details URL
pub fn batch_url(base_url: &str, id: &str) -> String {
    format!("{}/{}", batches_url(base_url), id)
}

/// Build batch report upload URL
pub fn batch_report_url(base_url: &str, id: &str) -> String {
    format!("{}/report", batch_url(base_url, id))
}

/// Build dataset details URL
pub fn dataset_url(base_url: &str, id: &str) -> String {
    format!("{}/datasets/{}", base_url.trim_end_matches('/'), id)
}

/// Build dataset state URL
pub fn dataset_states_url(base_url: &str, id: &str) -> String {
    format!("{}/states", dataset_url(base_url, id))
}
