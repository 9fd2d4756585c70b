/*!
Module with basic types used in fireflow.

This module contains the [`Address`](address/index.html) type for
addressing physical memory on a remote FireWire node.
*/

pub mod address;
pub use address::Address;
