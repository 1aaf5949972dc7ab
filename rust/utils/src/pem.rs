/// Splits a byte sequence into the PEM blocks carrying the given `label`
/// (for example `CERTIFICATE` or `CERTIFICATE REQUEST`).
///
/// Contents between blocks (comments, `subject=` lines, blocks with other labels) are skipped.
/// A header without a matching footer is dropped.
pub fn split_pem_blocks<'a>(pem: &'a [u8], label: &str) -> Vec<&'a [u8]> {
    let header = format!("-----BEGIN {label}-----");
    let footer = format!("-----END {label}-----");
    let (header, footer) = (header.as_bytes(), footer.as_bytes());

    let mut blocks = Vec::new();
    let mut rest = pem;
    while let Some(start) = find(rest, header) {
        let body = &rest[start + header.len()..];
        let Some(end) = find(body, footer) else {
            break;
        };
        let block_len = header.len() + end + footer.len();
        blocks.push(&rest[start..start + block_len]);
        rest = &rest[start + block_len..];
    }
    blocks
}

/// Splits a byte sequence of PEM-encoded certificates, such as a CA bundle.
pub fn split_pem_certificates(pem: &[u8]) -> Vec<&[u8]> {
    split_pem_blocks(pem, "CERTIFICATE")
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
