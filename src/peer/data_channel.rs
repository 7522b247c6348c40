use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use crate::error::EndpointError;
use crate::peer::endpoint::DataChannel;
use crate::peer::events::EventHub;

/// webrtc-rs data channel with its handlers bridged into subscriptions.
pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    messages: Arc<EventHub<String>>,
    state: watch::Receiver<RTCDataChannelState>,
}

impl RtcDataChannel {
    /// Installs open/close/message handlers on `dc`.
    pub fn attach(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let label = dc.label().to_string();
        let messages = Arc::new(EventHub::new());
        let (state_tx, state_rx) = watch::channel(dc.ready_state());
        let state_tx = Arc::new(state_tx);

        dc.on_open(Box::new({
            let state_tx = Arc::clone(&state_tx);
            let label = label.clone();
            move || {
                info!("Data channel '{}' opened", label);
                state_tx.send_replace(RTCDataChannelState::Open);
                Box::pin(async {})
            }
        }));

        dc.on_close(Box::new({
            let state_tx = Arc::clone(&state_tx);
            let label = label.clone();
            move || {
                info!("Data channel '{}' closed", label);
                state_tx.send_replace(RTCDataChannelState::Closed);
                Box::pin(async {})
            }
        }));

        dc.on_message(Box::new({
            let messages = Arc::clone(&messages);
            let label = label.clone();
            move |msg: DataChannelMessage| {
                let text = String::from_utf8_lossy(&msg.data).into_owned();
                debug!(
                    "Data channel '{}' received {} byte(s), string={}",
                    label,
                    msg.data.len(),
                    msg.is_string
                );
                messages.publish(text);
                Box::pin(async {})
            }
        }));

        Arc::new(Self {
            dc,
            label,
            messages,
            state: state_rx,
        })
    }

    async fn wait_open(&self) -> Result<(), EndpointError> {
        let mut state = self.state.clone();
        let settled = state
            .wait_for(|s| !matches!(s, RTCDataChannelState::Connecting | RTCDataChannelState::Unspecified))
            .await
            .map_err(|_| EndpointError::Closed)?;
        match *settled {
            RTCDataChannelState::Open => Ok(()),
            _ => Err(EndpointError::Closed),
        }
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: &str) -> Result<(), EndpointError> {
        self.wait_open().await?;
        let sent = self.dc.send_text(text.to_owned()).await?;
        debug!("Sent {} byte(s) on '{}'", sent, self.label);
        Ok(())
    }

    fn subscribe_messages(&self) -> UnboundedReceiver<String> {
        self.messages.subscribe()
    }

    async fn close(&self) -> Result<(), EndpointError> {
        self.messages.close();
        self.dc.close().await?;
        Ok(())
    }
}
