use cb_common::Secret;
use log::*;

pub const DEFAULT_PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone, Default)]
pub struct PocketBaseConfig {
    /// Base URL of the PocketBase server, always with a trailing slash
    pub url: String,
    pub email: String,
    pub password: Secret<String>,
    /// Page size used when listing every record that matches a filter
    pub page_size: u32,
}

impl PocketBaseConfig {
    pub fn new<S: Into<String>>(url: S, email: S, password: S) -> Self {
        Self {
            url: normalize_url(url.into()),
            email: email.into(),
            password: Secret::new(password.into()),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn new_from_env_or_default() -> Self {
        let url = std::env::var("CBG_POCKETBASE_URL").unwrap_or_else(|_| {
            warn!("🗄️ CBG_POCKETBASE_URL not set, using http://127.0.0.1:8090/ as default");
            "http://127.0.0.1:8090/".to_string()
        });
        let email = std::env::var("CBG_POCKETBASE_EMAIL").unwrap_or_else(|_| {
            warn!("🗄️ CBG_POCKETBASE_EMAIL not set, using (probably useless) default");
            "admin@example.com".to_string()
        });
        let password = Secret::new(std::env::var("CBG_POCKETBASE_PASSWORD").unwrap_or_else(|_| {
            warn!("🗄️ CBG_POCKETBASE_PASSWORD not set, using (probably useless) default");
            String::default()
        }));
        let page_size = std::env::var("CBG_POCKETBASE_PAGE_SIZE")
            .ok()
            .and_then(|s| {
                s.parse::<u32>()
                    .map_err(|e| warn!("🗄️ Invalid CBG_POCKETBASE_PAGE_SIZE ({s}): {e}. Using {DEFAULT_PAGE_SIZE}"))
                    .ok()
            })
            .unwrap_or(DEFAULT_PAGE_SIZE);
        Self { url: normalize_url(url), email, password, page_size: page_size.clamp(1, 500) }
    }
}

fn normalize_url(mut url: String) -> String {
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}
