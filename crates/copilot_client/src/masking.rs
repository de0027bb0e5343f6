/// Mask a credential for logs and `Debug` output, keeping only a short prefix.
pub fn mask_secret(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    if secret.chars().count() <= 8 {
        "[MASKED]".to_string()
    } else {
        format!("{visible}...[MASKED]")
    }
}

/// Mask the value of an `Authorization` header, preserving the scheme.
pub fn mask_authorization(value: &str) -> String {
    match value.split_once(' ') {
        Some((scheme, secret)) => format!("{scheme} {}", mask_secret(secret)),
        None => mask_secret(value),
    }
}
