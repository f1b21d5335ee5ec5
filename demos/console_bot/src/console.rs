//! A transport that prints responses to stdout.

use async_trait::async_trait;
use kestrel::prelude::*;
use kestrel::core::DynamicValue;

use crate::plugins::Uptime;

pub struct ConsoleTransport;

#[async_trait]
impl Transport for ConsoleTransport {
    async fn send(
        &self,
        conversation: &ConversationId,
        response: &Response,
    ) -> Result<(), TransportError> {
        match &response.reply_to {
            Some(_) => println!("[bot -> {}] {}", conversation.user, response.text),
            None => println!("[bot] {}", response.text),
        }
        Ok(())
    }

    async fn forward_dynamic(
        &self,
        _conversation: &ConversationId,
        value: DynamicValue,
    ) -> Result<(), TransportError> {
        let uptime = value
            .downcast::<Uptime>()
            .map_err(|_| TransportError::Unsupported("console prints uptime only".into()))?;
        println!("[bot] up for {:.1}s", uptime.0.as_secs_f64());
        Ok(())
    }
}
