//! Start-marker handling for encoder output

/// Annex-B 4-byte start code
pub const START_CODE_4: [u8; 4] = [0, 0, 0, 1];
/// Annex-B 3-byte start code
pub const START_CODE_3: [u8; 3] = [0, 0, 1];

/// Length of the start code at the beginning of `data`, if any
pub fn start_code_len(data: &[u8]) -> usize {
    if data.starts_with(&START_CODE_4) {
        START_CODE_4.len()
    } else if data.starts_with(&START_CODE_3) {
        START_CODE_3.len()
    } else {
        0
    }
}

/// Strip a leading start code, leaving only the unit payload
///
/// Data without a start code is returned unchanged.
pub fn strip_start_code(data: &[u8]) -> &[u8] {
    &data[start_code_len(data)..]
}
