pub mod config;
pub mod delegate;
pub mod error;
pub mod events;
pub mod http;
pub mod output;
pub mod query;
pub mod session;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::delegate::{DelegateInvoker, ProcessDelegate};
use crate::events::EventSink;
use crate::http::AppState;
use crate::query::QueryLayer;
use crate::session::SessionManager;
use crate::store::ItemStore;

/// Item store laid out as configured
pub fn store_from_config(config: &Config) -> ItemStore {
    ItemStore::new(
        config.questions_dir(),
        config.answers_dir(),
        config.state_file(),
        config.context_file(),
    )
}

/// Wire store, delegate process, session manager and query layer from configuration
pub fn build_state(config: &Config, events: Arc<dyn EventSink>) -> AppState {
    let store = store_from_config(config);
    let delegate = ProcessDelegate::new(config.delegate.program.clone())
        .with_cwd(config.storage.data_dir.clone());
    let invoker = DelegateInvoker::new(
        Arc::new(delegate),
        events.clone(),
        Duration::from_millis(config.delegate.timeout_ms),
    )
    .serialized(config.delegate.serialize);
    let manager = SessionManager::new(invoker, store.clone(), events)
        .with_output_parser(output::parser_for(config.delegate.output_format));

    AppState::new(manager, QueryLayer::new(store))
}
