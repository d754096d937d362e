//! `atob` / `btoa` host ops.
//!
//! The web definitions operate on byte strings: every char code must fit in
//! one byte. The host side maps chars <-> bytes explicitly, so binary data
//! survives the UTF-8 hop across the boundary.

use crate::base64;
use warren_engine::{op_sync, OpDecl, OpError, OpResult};

pub fn ops() -> Vec<OpDecl> {
    vec![op_sync("btoa", 1, btoa), op_sync("atob", 1, atob)]
}

fn btoa(args: Vec<String>) -> OpResult {
    let mut bytes = Vec::with_capacity(args[0].len());
    for c in args[0].chars() {
        let code = c as u32;
        if code > 0xff {
            return Err(OpError::new(
                "btoa: character out of latin1 range".to_string(),
            ));
        }
        bytes.push(code as u8);
    }
    Ok(base64::encode(&bytes))
}

fn atob(args: Vec<String>) -> OpResult {
    let bytes = base64::decode(args[0].trim()).map_err(OpError::new)?;
    Ok(bytes.iter().map(|&b| char::from(b)).collect())
}
