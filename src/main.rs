//! `lfcc` command console.
//!
//! Connects to the configured robot, prints every JSON message it sends and
//! writes each stdin line to the first write channel.

use log::{error, info, warn};
use serde_json::Value;
use tokio::{
   io::{AsyncBufReadExt, BufReader},
   select, signal,
};

use lfcc_transport::{Codec, Config, ConnectionManager, Result, select_device};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting lfcc console...");

   // Load configuration
   let config = Config::load().inspect_err(|e| error!("{e}. {}", e.action()))?;
   info!(
      "Loaded configuration with {} channels",
      config.services.channel_count()
   );

   let device = select_device(&config)
      .await
      .inspect_err(|e| error!("{e}. {}", e.action()))?;

   let manager = ConnectionManager::new(Codec::new(config.encoding));
   manager
      .connect(device, config.services.clone())
      .await
      .inspect_err(|e| error!("{e}. {}", e.action()))?;

   for mapping in config.services.channels().filter(|c| c.id.is_notify()) {
      let name = mapping.id.clone();
      manager
         .add_subscription(
            mapping.id.clone(),
            move |value: Value| println!("{name}: {value}"),
            None,
         )
         .await?;
   }

   let command_channel = config
      .services
      .channels()
      .map(|c| c.id.clone())
      .find(|id| !id.is_notify());
   if command_channel.is_none() {
      warn!("No write channel configured, input will be ignored");
   }

   let mut lines = BufReader::new(tokio::io::stdin()).lines();
   let mut state = manager.watch_state();

   loop {
      select! {
         line = lines.next_line() => {
            let Some(line) = line? else {
               break;
            };
            if let Some(channel) = &command_channel
               && let Err(e) = manager.send(channel, line.trim_end()).await
            {
               error!("{e}. {}", e.action());
            }
         }
         _ = signal::ctrl_c() => {
            info!("Interrupted");
            break;
         }
         changed = state.changed() => {
            if changed.is_err() || !state.borrow().is_connected() {
               warn!("Link to the robot was lost");
               break;
            }
         }
      }
   }

   manager.disconnect().await;
   info!("Shutting down lfcc console...");
   Ok(())
}
