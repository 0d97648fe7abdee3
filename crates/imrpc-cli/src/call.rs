//! Client side of `imrpc call`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;

use imrpc_balancer::{
    group_filter, AddressSink, Balancer, PickerBuilder, RoundRobinBuilder, ServiceInstance,
    WeightedBuilder,
};
use imrpc_client::{CallOptions, Client, ClientConfig, Target};
use imrpc_common::codec::compressor_by_name;
use imrpc_common::ImrpcError;

/// One `--addr` value: `host:port[@group][*weight]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub group: String,
    pub weight: u32,
}

/// Parses an endpoint such as `127.0.0.1:7000`, `127.0.0.1:7000@A` or
/// `127.0.0.1:7000@A*3`.
pub fn parse_endpoint(raw: &str) -> Result<Endpoint> {
    let (rest, weight) = match raw.rsplit_once('*') {
        Some((rest, weight)) => {
            let weight = weight
                .parse()
                .with_context(|| format!("invalid weight in '{}'", raw))?;
            (rest, weight)
        }
        None => (raw, 1),
    };
    let (address, group) = match rest.split_once('@') {
        Some((address, group)) => (address, group),
        None => (rest, ""),
    };
    if address.is_empty() {
        return Err(anyhow!("missing address in '{}'", raw));
    }
    Ok(Endpoint {
        address: address.to_string(),
        group: group.to_string(),
        weight,
    })
}

/// What `imrpc call` should do.
#[derive(Debug, Clone, Default)]
pub struct CallPlan {
    pub service: String,
    pub method: String,
    pub endpoints: Vec<Endpoint>,
    pub args: String,
    pub timeout: Option<Duration>,
    pub oneway: bool,
    pub compressor: String,
    pub group: Option<String>,
    pub weighted: bool,
    pub broadcast: bool,
}

impl CallPlan {
    pub fn options(&self) -> CallOptions {
        let mut options = CallOptions::new().with_oneway(self.oneway);
        if let Some(timeout) = self.timeout {
            options = options.with_timeout(timeout);
        }
        if let Some(group) = &self.group {
            options = options.with_group(group.clone());
        }
        options
    }

    /// Builds the client. A single endpoint without a group is called
    /// directly; anything else goes through a balancer.
    pub fn client(&self) -> Result<Client> {
        let config = ClientConfig {
            compressor: compressor_by_name(&self.compressor)?,
            ..ClientConfig::default()
        };

        let target = match self.endpoints.as_slice() {
            [] => return Err(anyhow!("at least one --addr is required")),
            [only] if only.group.is_empty() && !self.broadcast => Target::Direct(only.address.clone()),
            endpoints => {
                let builder: Arc<dyn PickerBuilder> = if self.weighted {
                    Arc::new(WeightedBuilder::new().with_filter(group_filter()))
                } else {
                    Arc::new(RoundRobinBuilder::new().with_filter(group_filter()))
                };
                let balancer = Arc::new(Balancer::new(self.service.clone(), builder));
                balancer.update_state(
                    endpoints
                        .iter()
                        .map(|e| {
                            ServiceInstance::new(self.service.clone(), e.address.clone())
                                .with_group(e.group.clone())
                                .with_weight(e.weight)
                        })
                        .collect(),
                );
                Target::Balanced(balancer)
            }
        };
        Ok(Client::new(target, config))
    }

    /// Runs the call and returns the lines to print.
    pub async fn run(&self) -> Result<Vec<String>> {
        let args: Value = serde_json::from_str(&self.args)
            .map_err(|e| anyhow!("Invalid JSON in args: {}", e))?;
        let client = self.client()?;

        if self.broadcast {
            let results = client
                .broadcast::<_, Value>(&self.service, &self.method, &args, self.options())
                .await?;
            return results
                .into_iter()
                .map(|r| {
                    let outcome = match r.result {
                        Ok(value) => serde_json::json!({ "address": r.address, "result": value }),
                        Err(e) => serde_json::json!({ "address": r.address, "error": e.to_string() }),
                    };
                    Ok(serde_json::to_string(&outcome)?)
                })
                .collect();
        }

        match client
            .call::<_, Value>(&self.service, &self.method, &args, self.options())
            .await
        {
            Ok(value) => Ok(vec![serde_json::to_string(&value)?]),
            // Expected outcome of a one-way call
            Err(ImrpcError::Oneway) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}
