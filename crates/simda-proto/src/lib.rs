//! Wire types for the simda snapshot stream.
//!
//! Everything in [`pb`] is generated from `proto/simda.proto` by
//! `tonic-prost-build`. The schema is a fixed external contract — snapshot
//! producers fill these types, the transport ships them verbatim.

pub mod pb {
    #![allow(clippy::all)]
    include!(concat!(env!("OUT_DIR"), "/simda.v1.rs"));
}
