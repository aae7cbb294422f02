//! RabbitMQ test infrastructure

use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::rabbitmq::RabbitMq;

/// RabbitMQ container with the default `guest`/`guest` account on vhost `/`.
pub struct TestRabbitMq {
    #[allow(dead_code)]
    container: ContainerAsync<RabbitMq>,
    host: String,
    port: u16,
}

impl TestRabbitMq {
    pub async fn new() -> Self {
        let container = RabbitMq::default()
            .start()
            .await
            .expect("Failed to start RabbitMQ container");

        let port = container
            .get_host_port_ipv4(5672)
            .await
            .expect("Failed to get RabbitMQ port");

        tracing::info!(port, "Test RabbitMQ ready");

        Self {
            container,
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        "guest"
    }

    pub fn password(&self) -> &str {
        "guest"
    }

    pub fn uri(&self) -> String {
        format!("amqp://guest:guest@{}:{}/%2f", self.host, self.port)
    }
}

impl Drop for TestRabbitMq {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test RabbitMQ container");
    }
}
