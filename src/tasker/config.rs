use std::env;

use typed_builder::TypedBuilder;

/// Where the queue collection lives, plus the optional messaging transport names.
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct MQueueConfig {
    // full connection string, wins over host and port
    #[builder(default = None)]
    pub connection_str: Option<String>,
    #[builder(default = "localhost".to_string())]
    pub host: String,
    #[builder(default = 27017)]
    pub port: u16,
    // used when the connection string names no default database
    #[builder(default = "mtaskq".to_string())]
    pub database: String,
    #[builder(default = "tasks".to_string())]
    pub collection: String,
    #[builder(default = None)]
    pub response_topic: Option<String>,
    #[builder(default = None)]
    pub response_subscription: Option<String>,
}

impl Default for MQueueConfig {
    fn default() -> Self {
        MQueueConfig::builder().build()
    }
}

impl MQueueConfig {
    /// read overrides from the environment, nothing is required
    pub fn from_env() -> MQueueConfig {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> MQueueConfig {
        let mut config = MQueueConfig::default();
        config.connection_str = lookup("MongoStr");
        if let Some(database) = lookup("MTASKQ_DATABASE") {
            config.database = database;
        }
        if let Some(collection) = lookup("MTASKQ_COLLECTION") {
            config.collection = collection;
        }
        config.response_topic = lookup("MTASKQ_RESPONSE_TOPIC");
        config.response_subscription = lookup("MTASKQ_RESPONSE_SUBSCRIPTION");
        config
    }

    pub fn connection_uri(&self) -> String {
        match &self.connection_str {
            Some(connection_str) => connection_str.clone(),
            None => format!("mongodb://{}:{}", self.host, self.port),
        }
    }
}
