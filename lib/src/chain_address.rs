// Bmv
// Copyright (C) 2024  Bmv contributors
// SPDX-License-Identifier: GPL-3.0-or-later WITH Classpath-exception-2.0

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Cross-chain addresses of the form `btp://<network>/<account>`.
//!
//! The network part identifies a blockchain (for instance `0x42.icon`), and the account part an
//! address on that blockchain. The [`Verifier`](crate::verifier::Verifier) uses these addresses
//! to check that an incoming relay message is really destined to the message center it guards.

use alloc::string::String;
use core::{fmt, str::FromStr};

/// Address of a contract or account on a specific blockchain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainAddress {
    network: String,
    account: String,
}

impl ChainAddress {
    /// Builds an address from its two components.
    ///
    /// Returns an error if either component is empty or contains a `/`.
    pub fn new(network: impl Into<String>, account: impl Into<String>) -> Result<Self, ParseError> {
        let network = network.into();
        let account = account.into();
        if network.is_empty() || network.contains('/') {
            return Err(ParseError::InvalidNetwork);
        }
        if account.is_empty() || account.contains('/') {
            return Err(ParseError::InvalidAccount);
        }
        Ok(ChainAddress { network, account })
    }

    /// Blockchain identifier part of the address.
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Account part of the address.
    pub fn account(&self) -> &str {
        &self.account
    }
}

impl FromStr for ChainAddress {
    type Err = ParseError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        let rest = string.strip_prefix("btp://").ok_or(ParseError::BadScheme)?;
        let (network, account) = rest.split_once('/').ok_or(ParseError::MissingAccount)?;
        ChainAddress::new(network, account)
    }
}

impl fmt::Display for ChainAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "btp://{}/{}", self.network, self.account)
    }
}

/// Error while parsing a [`ChainAddress`].
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum ParseError {
    /// Address doesn't start with `btp://`.
    #[display(fmt = "address doesn't start with `btp://`")]
    BadScheme,
    /// No `/` separating the network from the account.
    #[display(fmt = "no `/` separating the network from the account")]
    MissingAccount,
    /// Network part is empty or contains a `/`.
    #[display(fmt = "invalid network part")]
    InvalidNetwork,
    /// Account part is empty or contains a `/`.
    #[display(fmt = "invalid account part")]
    InvalidAccount,
}
