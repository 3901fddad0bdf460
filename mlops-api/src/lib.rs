//! API types shared between the mlops operator and its clients: the three
//! user-declared custom kinds, the Istio routing kinds the operator owns and
//! the wire-level constants of the serving contract.

pub mod consts;
pub mod crd;
pub mod istio;
