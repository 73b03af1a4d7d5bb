use mongodb::bson::Document;
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection};
use tracing::info;

use crate::tasker::config::MQueueConfig;
use crate::tasker::error::MResult;

/// connect and return the queue collection named by `config`
pub async fn connect(config: &MQueueConfig) -> MResult<Collection<Document>> {
    get_collection(config.connection_uri(), &config.database, &config.collection).await
}

/// the connection string's default database wins over `fallback_database`
pub async fn get_collection<T: Send + Sync>(connection_str: impl AsRef<str>, fallback_database: impl AsRef<str>, collection_name: impl AsRef<str>) -> MResult<Collection<T>> {
    let client_options = ClientOptions::parse(connection_str.as_ref()).await?;
    let target_database = client_options.default_database.clone()
        .unwrap_or_else(|| fallback_database.as_ref().to_string());
    // Get a handle to the deployment.
    let client = Client::with_options(client_options)?;
    let database = client.database(target_database.as_str());
    info!("using collection {}.{}", &target_database, collection_name.as_ref());
    Ok(database.collection::<T>(collection_name.as_ref()))
}
