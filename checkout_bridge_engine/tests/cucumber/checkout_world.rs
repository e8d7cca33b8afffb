use std::{fmt::Debug, sync::Arc};

use checkout_bridge_engine::{
    leases::SessionRegistry,
    test_utils::{MemoryRecordStore, ScriptedProvider},
    ExportError,
    ExportOutcome,
    OrderExportApi,
};
use cucumber::World;

pub const ORDERS: &str = "payment";

#[derive(Default, World)]
pub struct CheckoutWorld {
    pub store: MemoryRecordStore,
    pub provider: ScriptedProvider,
    pub registry: SessionRegistry,
    pub last_outcome: Option<Result<ExportOutcome, ExportError>>,
}

impl Debug for CheckoutWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckoutWorld")
            .field("writes", &self.store.writes().len())
            .field("active", &self.registry.active_count())
            .field("last_outcome", &self.last_outcome)
            .finish()
    }
}

impl CheckoutWorld {
    pub fn api(&self) -> OrderExportApi<MemoryRecordStore, ScriptedProvider> {
        let store = Arc::new(self.store.clone());
        OrderExportApi::new(store, Arc::new(self.provider.clone()), self.registry.clone(), ORDERS)
    }
}
