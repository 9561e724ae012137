use std::sync::Arc;

use derivative::Derivative;

use crate::resolve::template::InputTemplate;
use crate::resolve::template::Variable;
use crate::resolve::DataSource;

/// Loads attached to an object.
#[derive(Clone, Debug, PartialEq)]
pub enum Fetch {
    Single(SingleFetch),
    /// Loads running concurrently. Every one completes before the fields are resolved.
    Parallel(ParallelFetch),
    /// Loads running in order. Later loads see the data of earlier ones as object variables.
    Serial(SerialFetch),
}

#[derive(Clone, Derivative)]
#[derivative(Debug, PartialEq)]
pub struct SingleFetch {
    pub buffer_id: usize,
    pub input: InputTemplate,
    #[derivative(Debug = "ignore", PartialEq = "ignore")]
    pub data_source: Arc<dyn DataSource>,
    /// The variables referenced by `input`, in placeholder order.
    pub variables: Vec<Variable>,
    /// Always load, even when an identical load is in flight.
    pub disallow_single_flight: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParallelFetch {
    pub fetches: Vec<Fetch>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SerialFetch {
    pub fetches: Vec<Fetch>,
}

impl SingleFetch {
    /// A fetch whose input is `input` with `$$<index>$$` placeholders for `variables`.
    pub fn new(
        buffer_id: usize,
        data_source: Arc<dyn DataSource>,
        input: &str,
        variables: Vec<Variable>,
    ) -> Self {
        Self {
            buffer_id,
            input: InputTemplate::parse(input, &variables),
            data_source,
            variables,
            disallow_single_flight: false,
        }
    }

    pub fn disallow_single_flight(mut self) -> Self {
        self.disallow_single_flight = true;
        self
    }
}

impl Fetch {
    /// The buffers produced by this fetch.
    pub fn buffer_ids(&self) -> Vec<usize> {
        match self {
            Fetch::Single(single) => vec![single.buffer_id],
            Fetch::Parallel(ParallelFetch { fetches }) | Fetch::Serial(SerialFetch { fetches }) => {
                fetches.iter().flat_map(Fetch::buffer_ids).collect()
            }
        }
    }

    /// Adds `other` to run alongside this fetch.
    pub(crate) fn parallel(self, other: Fetch) -> Fetch {
        match self {
            Fetch::Parallel(mut parallel) => {
                parallel.fetches.push(other);
                Fetch::Parallel(parallel)
            }
            fetch => Fetch::Parallel(ParallelFetch {
                fetches: vec![fetch, other],
            }),
        }
    }

    /// Adds `other` to run after this fetch.
    pub(crate) fn serial(self, other: Fetch) -> Fetch {
        match self {
            Fetch::Serial(mut serial) => {
                serial.fetches.push(other);
                Fetch::Serial(serial)
            }
            fetch => Fetch::Serial(SerialFetch {
                fetches: vec![fetch, other],
            }),
        }
    }
}

impl From<SingleFetch> for Fetch {
    fn from(fetch: SingleFetch) -> Self {
        Fetch::Single(fetch)
    }
}
