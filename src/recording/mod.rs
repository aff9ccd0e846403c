// SPDX-License-Identifier: MIT
pub mod format;
pub mod reader;
pub mod writer;
