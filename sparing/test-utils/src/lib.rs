// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helpers for testing the sparing protocol against a simulated array

mod log;
mod sim;

pub use log::test_setup_log;
pub use sim::{
    ACTIVE, GROUP, PASSIVE, SimAction, SimArray, SimArrayBuilder, SimDrive,
};
