//! Repair of CA certificates that were stored on a single line.

const PEM_HEADER: &str = "-----BEGIN CERTIFICATE-----";
const PEM_FOOTER: &str = "-----END CERTIFICATE-----";
const PEM_LINE_WIDTH: usize = 64;

/// Restores the line structure of a PEM certificate that lost its line breaks.
///
/// Text that already contains a line break, or that carries no PEM header, is
/// returned unchanged.
pub fn normalize_ca_cert(cert: &str) -> String {
    if cert.contains('\n') || !cert.contains(PEM_HEADER) {
        return cert.to_string();
    }

    let framed = cert
        .replacen(PEM_HEADER, &format!("{}\n", PEM_HEADER), 1)
        .replacen(PEM_FOOTER, &format!("\n{}", PEM_FOOTER), 1);

    let wrapped = framed
        .split('\n')
        .map(wrap_line)
        .collect::<Vec<_>>()
        .join("\n");

    wrapped.replace("\n\n", "\n").trim().to_string()
}

/// Appends a break after every full row of `PEM_LINE_WIDTH` characters.
fn wrap_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len() + line.len() / PEM_LINE_WIDTH + 1);
    let mut column = 0;
    for c in line.chars() {
        out.push(c);
        column += 1;
        if column == PEM_LINE_WIDTH {
            out.push('\n');
            column = 0;
        }
    }
    out
}
