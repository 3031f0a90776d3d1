#![no_main]

use libfuzzer_sys::fuzz_target;
use tds_wire::{Progress, Token, TokenType, Validation};

fuzz_target!(|data: &[u8]| {
    let mut rest = data;
    while let Some((&tag, body)) = rest.split_first() {
        let Some(token_type) = TokenType::from_u8(tag) else {
            return;
        };
        match Token::decode_body(token_type, body, Validation::Lenient) {
            Ok(Progress::Ready((token, consumed))) => {
                assert!(consumed <= body.len());
                // Decoding must be resumable: a truncated body is never complete.
                if consumed > 0 {
                    let prefix = &body[..consumed - 1];
                    assert!(!matches!(
                        Token::decode_body(token_type, prefix, Validation::Lenient),
                        Ok(Progress::Ready(_))
                    ));
                }
                if matches!(token, Token::Row) {
                    // Row values need column metadata to be walked.
                    return;
                }
                rest = &body[consumed..];
            }
            Ok(Progress::NeedMoreData) | Err(_) => return,
        }
    }
});
