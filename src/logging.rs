use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "postoffice=info,tower_http=info";

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// Security events are emitted under the `postoffice::security` target and
/// routing failures under `postoffice::operator`, so either can be raised or
/// silenced on its own, e.g. `RUST_LOG=postoffice=warn,postoffice::operator=error`.
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
