use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Read, Write};

use log::error;

use crate::backend::StoreError;

pub type KeyValues = BTreeMap<String, String>;

pub fn read(input: impl Read) -> Result<KeyValues, StoreError> {
    let mut kv = BTreeMap::new();

    for line in BufReader::new(input).lines() {
        let line = line?;

        let (k, v) = line.split_once(':').ok_or_else(|| {
            error!("invalid line, can't split");
            StoreError::Corrupt(format!("no colon in {line:?}"))
        })?;

        let Some(v) = v.strip_prefix(' ') else {
            error!("invalid line - no whitespace after colon");
            return Err(StoreError::Corrupt(format!("no space after colon in {line:?}")));
        };
        kv.insert(k.into(), v.into());
    }

    Ok(kv)
}

pub fn write(mut output: impl Write, keyvalues: &KeyValues) -> io::Result<()> {
    for (k, v) in keyvalues {
        writeln!(output, "{}: {}", k, v)?;
    }
    output.flush()
}

pub fn require<'a>(keyvalues: &'a KeyValues, key: &str) -> Result<&'a str, StoreError> {
    keyvalues
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| StoreError::Corrupt(format!("missing key {key:?}")))
}
