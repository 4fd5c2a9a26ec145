use std::io;

use sentry_core::ReasonCode;

/// Failure classes an outbound TLS handshake can land in. The certificate
/// class covers everything the peer-verification path can reject; the
/// handshake class covers alerts, version mismatches, and transport-level
/// failures during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsFailureClass {
    CertificateValidation,
    Handshake,
}

impl TlsFailureClass {
    pub fn reason_code(self) -> ReasonCode {
        match self {
            Self::CertificateValidation => ReasonCode::CertificateValidationError,
            Self::Handshake => ReasonCode::TlsHandshakeError,
        }
    }
}

/// Classifies a handshake failure surfaced by the TLS connector. The
/// rustls error is matched structurally when the I/O error wraps one;
/// otherwise the textual form is classified, which is the fallback for
/// failure classes the TLS library does not surface as typed values.
pub fn classify_handshake_error(error: &io::Error) -> TlsFailureClass {
    if let Some(tls_error) = error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        return match tls_error {
            rustls::Error::InvalidCertificate(_) => TlsFailureClass::CertificateValidation,
            _ => TlsFailureClass::Handshake,
        };
    }
    classify_tls_failure_text(&error.to_string())
}

pub fn classify_tls_failure_text(text: &str) -> TlsFailureClass {
    let lower = text.to_ascii_lowercase();
    if contains_any(
        &lower,
        &[
            "invalid peer certificate",
            "certificate verify failed",
            "unknown ca",
            "unknown issuer",
            "unknown authority",
            "self signed",
            "self-signed",
            "hostname mismatch",
            "name mismatch",
            "notvalidforname",
            "certificate",
            "x509",
            "expired",
        ],
    ) {
        TlsFailureClass::CertificateValidation
    } else {
        TlsFailureClass::Handshake
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

#[cfg(test)]
mod tests {
    use std::io;

    use sentry_core::ReasonCode;

    use super::{classify_handshake_error, classify_tls_failure_text, TlsFailureClass};

    #[test]
    fn structured_invalid_certificate_maps_to_certificate_class() {
        let tls_error = rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer);
        let io_error = io::Error::new(io::ErrorKind::InvalidData, tls_error);
        assert_eq!(
            classify_handshake_error(&io_error),
            TlsFailureClass::CertificateValidation
        );
    }

    #[test]
    fn structured_alert_maps_to_handshake_class() {
        let tls_error = rustls::Error::AlertReceived(rustls::AlertDescription::HandshakeFailure);
        let io_error = io::Error::new(io::ErrorKind::InvalidData, tls_error);
        assert_eq!(
            classify_handshake_error(&io_error),
            TlsFailureClass::Handshake
        );
    }

    #[test]
    fn text_fallback_covers_common_certificate_failures() {
        for text in [
            "invalid peer certificate: UnknownIssuer",
            "certificate verify failed: unknown ca",
            "x509: certificate has expired",
            "hostname mismatch",
            "tls: self-signed certificate in chain",
        ] {
            assert_eq!(
                classify_tls_failure_text(text),
                TlsFailureClass::CertificateValidation,
                "{text}"
            );
        }
    }

    #[test]
    fn text_fallback_treats_other_failures_as_handshake() {
        for text in [
            "received fatal alert: handshake failure",
            "peer is incompatible: protocol version",
            "tls: decrypt error",
        ] {
            assert_eq!(
                classify_tls_failure_text(text),
                TlsFailureClass::Handshake,
                "{text}"
            );
        }
    }

    #[test]
    fn failure_classes_map_onto_reason_codes() {
        assert_eq!(
            TlsFailureClass::CertificateValidation.reason_code(),
            ReasonCode::CertificateValidationError
        );
        assert_eq!(
            TlsFailureClass::Handshake.reason_code(),
            ReasonCode::TlsHandshakeError
        );
    }
}
