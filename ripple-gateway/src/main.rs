use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use ripple_gateway::{
    ConnectionManager, Dispatcher, GatewayServer, JwtIdentity, RoutedGatewayPush,
};
use ripple_im_core::{init_tracing_from_config, load_config};
use ripple_message::{Fanout, MessageService, PgMessageRepository};
use ripple_message::repository::MessageRepository;
use ripple_presence::{RedisRouteRegistry, RouteRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config(None);
    init_tracing_from_config(Some(&config.logging));

    let rpc_timeout = Duration::from_secs(config.gateway.rpc_timeout_secs);

    let repo: Arc<dyn MessageRepository> = Arc::new(
        PgMessageRepository::connect(&config.postgres.url, config.postgres.max_connections)
            .await?,
    );
    let registry: Arc<dyn RouteRegistry> = Arc::new(
        RedisRouteRegistry::connect(&config.redis.url, config.presence.route_ttl_secs).await?,
    );

    let manager = Arc::new(ConnectionManager::new());
    let push = Arc::new(RoutedGatewayPush::new(
        &config.gateway.advertise_addr,
        manager.clone(),
        rpc_timeout,
    )?);
    let fanout = Arc::new(Fanout::new(
        repo.clone(),
        registry.clone(),
        push,
        rpc_timeout,
    ));
    let message = Arc::new(MessageService::new(repo).with_fanout(fanout));
    let dispatcher = Arc::new(Dispatcher::new(message.clone()));
    let identity = Arc::new(JwtIdentity::new(config.auth.jwt_secret.as_bytes()));

    info!(
        advertise_addr = %config.gateway.advertise_addr,
        "starting ripple gateway"
    );

    let server = GatewayServer::new(
        config.gateway.clone(),
        manager,
        dispatcher,
        identity,
        registry,
        message,
    );
    server.run().await?;
    Ok(())
}
