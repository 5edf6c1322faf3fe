use amqprs::{
    BasicProperties,
    callbacks::{DefaultChannelCallback, DefaultConnectionCallback},
    channel::{
        BasicConsumeArguments, BasicPublishArguments, Channel, ConsumerMessage,
        ExchangeDeclareArguments, QueueBindArguments, QueueDeclareArguments,
    },
    connection::{Connection, OpenConnectionArguments},
};
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};

use super::transport::{BrokerConnection, BrokerTransport};
use crate::error::{ConnectorError, ConnectorResult};

/// AMQP transport over a durable topic exchange.
///
/// Each connection declares the exchange, an exclusive server-named queue, and
/// consumes from it with auto-ack. Subscribing to an event type binds the
/// queue to the exchange with the type as routing key; publishing routes the
/// message under the event type.
pub struct AmqpTransport {
    url: String,
    app_id: String,
    exchange: String,
}

impl AmqpTransport {
    pub fn new(url: &str, app_id: &str, exchange: &str) -> Self {
        Self {
            url: url.to_owned(),
            app_id: app_id.to_owned(),
            exchange: exchange.to_owned(),
        }
    }
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    async fn connect(&self) -> ConnectorResult<Box<dyn BrokerConnection>> {
        let open_args = OpenConnectionArguments::try_from(self.url.as_str())
            .map_err(|err| ConnectorError::Connection(format!("invalid broker url: {}", err)))?;

        let connection = Connection::open(&open_args)
            .await
            .map_err(|err| ConnectorError::Connection(err.to_string()))?;
        connection
            .register_callback(DefaultConnectionCallback)
            .await
            .map_err(|err| ConnectorError::Connection(err.to_string()))?;

        let channel = connection
            .open_channel(None)
            .await
            .map_err(|err| ConnectorError::Connection(err.to_string()))?;
        channel
            .register_callback(DefaultChannelCallback)
            .await
            .map_err(|err| ConnectorError::Connection(err.to_string()))?;

        let exchange_args = ExchangeDeclareArguments::new(&self.exchange, "topic")
            .durable(true)
            .finish();
        channel
            .exchange_declare(exchange_args)
            .await
            .map_err(|err| ConnectorError::Connection(format!("exchange declare: {}", err)))?;

        let (queue_name, _, _) = channel
            .queue_declare(QueueDeclareArguments::exclusive_server_named())
            .await
            .map_err(|err| ConnectorError::Connection(format!("queue declare: {}", err)))?
            .expect("queue_declare returns a result when no_wait is false");

        let (_ctag, consumer) = channel
            .basic_consume_rx(
                BasicConsumeArguments::default()
                    .queue(queue_name.clone())
                    .auto_ack(true)
                    .finish(),
            )
            .await
            .map_err(|err| ConnectorError::Connection(format!("consume: {}", err)))?;

        info!(exchange = %self.exchange, queue = %queue_name, "amqp connection established");

        let props = BasicProperties::default()
            .with_app_id(&self.app_id)
            .with_delivery_mode(2)
            .finish();

        Ok(Box::new(AmqpConnection {
            connection,
            channel,
            queue_name,
            exchange: self.exchange.clone(),
            consumer,
            props,
        }))
    }
}

struct AmqpConnection {
    connection: Connection,
    channel: Channel,
    queue_name: String,
    exchange: String,
    consumer: UnboundedReceiver<ConsumerMessage>,
    props: BasicProperties,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn subscribe(&mut self, topic: &str) -> ConnectorResult<()> {
        let bind_args = QueueBindArguments::default()
            .queue(self.queue_name.clone())
            .exchange(self.exchange.clone())
            .routing_key(topic.to_owned())
            .finish();
        self.channel
            .queue_bind(bind_args)
            .await
            .map_err(|err| ConnectorError::Connection(format!("queue bind: {}", err)))?;
        debug!(%topic, "bound queue to topic");
        Ok(())
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        // The consumer channel closes when the underlying connection drops,
        // which is what signals connection loss to the receive loop.
        loop {
            let message = self.consumer.recv().await?;
            if let Some(content) = message.content {
                return Some(content);
            }
        }
    }

    async fn publish(&mut self, topic: &str, body: Vec<u8>) -> ConnectorResult<()> {
        let publish_args = BasicPublishArguments::new(&self.exchange, topic);
        self.channel
            .basic_publish(self.props.clone(), body, publish_args)
            .await
            .map_err(|err| ConnectorError::Publish(err.to_string()))
    }

    async fn close(&mut self) {
        if let Err(err) = self.connection.clone().close().await {
            debug!(%err, "error while closing amqp connection");
        }
    }
}
