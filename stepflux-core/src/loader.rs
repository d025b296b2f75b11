use std::future::Future;

use anyhow::Result;
use candle_core::Device;
use hf_hub::api::tokio::Api;

/// Fetches weights from the hub and builds a ready-to-run model on `device`.
pub trait Loader {
    /// What to load: variant, precision, local overrides.
    type Spec;
    type Model;

    fn load(spec: Self::Spec, api: Api, device: Device) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}
