use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::Handle;

/// Builder for runtime telemetry sinks.
pub struct RuntimeTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl RuntimeTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Debug,
            event_publisher: None,
        }
    }

    /// Sets the log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Lowest level written to the log file.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<RuntimeTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(Arc::new(JsonLogger::new(path)?.with_min_level(self.min_level))),
            None => None,
        };
        Ok(RuntimeTelemetry {
            module: Arc::from(self.module),
            logger,
            publisher: self.event_publisher,
        })
    }
}

/// Telemetry handle shared across runtime components.
///
/// Logs always reach `tracing`; the JSON file and the event publisher are optional.
#[derive(Clone)]
pub struct RuntimeTelemetry {
    module: Arc<str>,
    logger: Option<Arc<JsonLogger>>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl fmt::Debug for RuntimeTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeTelemetry")
            .field("module", &self.module)
            .field("file", &self.logger.as_ref().map(|logger| logger.path().to_path_buf()))
            .field("events", &self.publisher.is_some())
            .finish()
    }
}

impl RuntimeTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> RuntimeTelemetryBuilder {
        RuntimeTelemetryBuilder::new(module)
    }

    /// Handle that only mirrors logs to `tracing`.
    #[must_use]
    pub fn noop(module: impl Into<String>) -> Self {
        Self {
            module: Arc::from(module.into()),
            logger: None,
            publisher: None,
        }
    }

    /// Same sinks under a different module name.
    #[must_use]
    pub fn child(&self, module: impl Into<String>) -> Self {
        Self {
            module: Arc::from(module.into()),
            logger: self.logger.clone(),
            publisher: self.publisher.clone(),
        }
    }

    /// Module name stamped on records.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        let record = LogRecord::new(self.module.as_ref(), level, message).with_metadata(&metadata);
        match &self.logger {
            Some(logger) => logger.log(&record),
            None => {
                level.mirror(&record.module, &record.message, &record.metadata);
                Ok(())
            }
        }
    }

    /// Publishes an event and waits for the publisher.
    pub async fn publish(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(publisher) = &self.publisher {
            publisher
                .publish(EventRecord::new(self.module.as_ref(), event_type, payload))
                .await?;
        }
        Ok(())
    }

    /// Fire-and-forget event for synchronous call sites.
    ///
    /// Outside a tokio runtime the event is dropped.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        let Some(publisher) = &self.publisher else {
            return Ok(());
        };
        if let Ok(handle) = Handle::try_current() {
            let publisher = Arc::clone(publisher);
            let record = EventRecord::new(self.module.as_ref(), event_type, payload);
            handle.spawn(async move {
                if let Err(err) = publisher.publish(record).await {
                    tracing::warn!(target: "cognos", error = %err, "telemetry event publish failed");
                }
            });
        }
        Ok(())
    }
}
