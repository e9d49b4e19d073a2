mod attribution_flow;
mod fixtures;
mod reconcile_flow;
