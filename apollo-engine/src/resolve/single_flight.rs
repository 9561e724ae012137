//! Collapses identical concurrent loads.
//!
//! A load is identified by the data source identity and the rendered input. The first caller
//! for a key runs the load; callers arriving while it is in flight subscribe to its result and
//! receive a copy of it. Entries only live while their load is in flight.
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::Sender;

use crate::error::FetchError;
use crate::resolve::BufPair;
use crate::resolve::DataSource;
use crate::Context;

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct FlightKey {
    data_source: Bytes,
    input: Bytes,
}

/// What a load wrote, including the errors written before a failure, and how it ended.
type Outcome = (BufPair, Result<(), FetchError>);

type WaitMap = Arc<Mutex<HashMap<FlightKey, Sender<Outcome>>>>;

#[derive(Clone, Default)]
pub(crate) struct SingleFlight {
    wait_map: WaitMap,
}

/// Removes the entry of the leading load, even when that load is dropped before completion.
struct InFlight<'a> {
    wait_map: &'a WaitMap,
    key: &'a FlightKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.wait_map.lock().remove(self.key);
    }
}

impl SingleFlight {
    pub(crate) async fn load(
        &self,
        context: &Context,
        data_source: &dyn DataSource,
        input: Bytes,
        out: &mut BufPair,
    ) -> Result<(), FetchError> {
        let key = FlightKey {
            data_source: data_source.unique_identifier(),
            input,
        };
        loop {
            let waiting = {
                let mut locked_wait_map = self.wait_map.lock();
                match locked_wait_map.get(&key) {
                    // Register interest in key
                    Some(waiter) => Ok(waiter.subscribe()),
                    None => {
                        let (tx, _rx) = broadcast::channel(1);
                        locked_wait_map.insert(key.clone(), tx.clone());
                        Err(tx)
                    }
                }
            };

            let mut receiver = match waiting {
                Ok(receiver) => receiver,
                Err(tx) => return self.lead(context, data_source, &key, tx, out).await,
            };
            match receiver.recv().await {
                Ok((pair, result)) => {
                    tracing::debug!(
                        data_source = %String::from_utf8_lossy(&key.data_source),
                        "shared the result of an in-flight load"
                    );
                    out.copy_from(&pair);
                    return result;
                }
                // the leading load was dropped before completing, retry
                Err(_) => continue,
            }
        }
    }

    async fn lead(
        &self,
        context: &Context,
        data_source: &dyn DataSource,
        key: &FlightKey,
        tx: Sender<Outcome>,
        out: &mut BufPair,
    ) -> Result<(), FetchError> {
        let in_flight = InFlight {
            wait_map: &self.wait_map,
            key,
        };
        let mut pair = BufPair::new();
        let result = data_source.load(context, &key.input, &mut pair).await;
        drop(in_flight);

        out.copy_from(&pair);
        // nobody may be listening
        let _ = tx.send((pair, result.clone()));
        result
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.wait_map.lock().len()
    }
}
