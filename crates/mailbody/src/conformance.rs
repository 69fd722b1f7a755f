use std::str::FromStr;

bitflags::bitflags! {
    /// Records the recoveries made while parsing a message that did not
    /// quite follow the MIME rules. Flags of child parts are merged
    /// into their parents, so the root carries the union for the message.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct Conformance: u8 {
        const NON_CANONICAL_LINE_ENDINGS = 0b0000_0001;
        const MISSING_COLON_VALUE = 0b0000_0010;
        const INVALID_MIME_HEADERS = 0b0000_0100;
        const MISSING_BOUNDARY = 0b0000_1000;
        const MISSING_TERMINATOR = 0b0001_0000;
        const NESTING_TOO_DEEP = 0b0010_0000;
        const UNKNOWN_TRANSFER_ENCODING = 0b0100_0000;
    }
}

impl FromStr for Conformance {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        let mut result = Self::default();
        for ele in s.split('|') {
            if ele.is_empty() {
                continue;
            }
            match Self::from_name(ele) {
                Some(v) => {
                    result = result.union(v);
                }
                None => {
                    let mut possible: Vec<String> = Self::all()
                        .iter_names()
                        .map(|(name, _)| format!("'{name}'"))
                        .collect();
                    possible.sort();
                    let possible = possible.join(", ");
                    return Err(format!(
                        "invalid Conformance flag '{ele}', possible values are {possible}"
                    ));
                }
            }
        }
        Ok(result)
    }
}

impl std::fmt::Display for Conformance {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        names.sort();
        write!(fmt, "{}", names.join("|"))
    }
}
