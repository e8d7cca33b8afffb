use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuperUserRecord {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub collection_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    pub record: SuperUserRecord,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRecordsResponse<T> {
    pub page: u32,
    pub per_page: u32,
    pub total_items: i64,
    pub total_pages: i64,
    pub items: Vec<T>,
}

impl<T> ListRecordsResponse<T> {
    pub fn is_last_page(&self) -> bool {
        self.items.is_empty() || i64::from(self.page) >= self.total_pages
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRecordResponse {
    pub id: String,
}

/// The payload of the `PB_CONNECT` event that opens every realtime stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeConnect {
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RealtimeSubscriptions<'a> {
    pub client_id: &'a str,
    pub subscriptions: &'a [String],
}
