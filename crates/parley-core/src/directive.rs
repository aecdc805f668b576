//! In-band control tokens sharing the chat channel.
//!
//! Every outgoing and incoming text body is classified exactly once into a
//! [`Directive`]. Matching is against the whole trimmed body and ignores
//! ASCII case, so `"VC"` is a call request while `"vc please"` is chat.

use crate::media::MediaConstraints;

pub const ENTER_INCOGNITO_TOKEN: &str = "#";
/// Leaves incognito mode. `.` is the only accepted terminator.
pub const EXIT_INCOGNITO_TOKEN: &str = ".";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// `c`: audio only.
    Voice,
    /// `vc`: audio and video.
    Video,
    /// `svc`: video without audio.
    SilentVideo,
}

impl CallKind {
    pub fn token(self) -> &'static str {
        match self {
            CallKind::Voice => "c",
            CallKind::Video => "vc",
            CallKind::SilentVideo => "svc",
        }
    }

    pub fn constraints(self) -> MediaConstraints {
        match self {
            CallKind::Voice => MediaConstraints {
                audio: true,
                video: false,
            },
            CallKind::Video => MediaConstraints {
                audio: true,
                video: true,
            },
            CallKind::SilentVideo => MediaConstraints {
                audio: false,
                video: true,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Opaque chat content, kept exactly as typed.
    Chat(String),
    CallRequest(CallKind),
    EnterIncognito,
    ExitIncognito,
    /// Empty body: the hang-up convention.
    Hangup,
}

impl Directive {
    pub fn parse(text: &str) -> Self {
        let body = text.trim();
        if body.is_empty() {
            return Directive::Hangup;
        }
        match body.to_ascii_lowercase().as_str() {
            "c" => Directive::CallRequest(CallKind::Voice),
            "vc" => Directive::CallRequest(CallKind::Video),
            "svc" => Directive::CallRequest(CallKind::SilentVideo),
            ENTER_INCOGNITO_TOKEN => Directive::EnterIncognito,
            EXIT_INCOGNITO_TOKEN => Directive::ExitIncognito,
            _ => Directive::Chat(text.to_string()),
        }
    }

    pub fn is_chat(&self) -> bool {
        matches!(self, Directive::Chat(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_tokens_match_case_insensitively() {
        assert_eq!(Directive::parse("c"), Directive::CallRequest(CallKind::Voice));
        assert_eq!(Directive::parse("VC"), Directive::CallRequest(CallKind::Video));
        assert_eq!(
            Directive::parse(" Svc\n"),
            Directive::CallRequest(CallKind::SilentVideo)
        );
    }

    #[test]
    fn incognito_tokens() {
        assert_eq!(Directive::parse("#"), Directive::EnterIncognito);
        assert_eq!(Directive::parse(" . "), Directive::ExitIncognito);
    }

    #[test]
    fn only_whole_body_matches() {
        assert!(Directive::parse("call me").is_chat());
        assert!(Directive::parse("vc please").is_chat());
        assert!(Directive::parse("#hashtag").is_chat());
        assert!(Directive::parse("...").is_chat());
        assert!(Directive::parse("cc").is_chat());
    }

    #[test]
    fn alternate_terminators_are_chat() {
        assert!(Directive::parse("!").is_chat());
        assert!(Directive::parse("/").is_chat());
    }

    #[test]
    fn empty_body_is_hangup() {
        assert_eq!(Directive::parse(""), Directive::Hangup);
        assert_eq!(Directive::parse("   "), Directive::Hangup);
    }

    #[test]
    fn chat_keeps_original_text() {
        assert_eq!(
            Directive::parse("  hello  "),
            Directive::Chat("  hello  ".to_string())
        );
    }

    #[test]
    fn call_kind_constraints() {
        let voice = CallKind::Voice.constraints();
        assert!(voice.audio && !voice.video);
        let video = CallKind::Video.constraints();
        assert!(video.audio && video.video);
        let silent = CallKind::SilentVideo.constraints();
        assert!(!silent.audio && silent.video);
    }

    #[test]
    fn tokens_parse_back() {
        assert_eq!(Directive::parse(ENTER_INCOGNITO_TOKEN), Directive::EnterIncognito);
        assert_eq!(Directive::parse(EXIT_INCOGNITO_TOKEN), Directive::ExitIncognito);
        for kind in [CallKind::Voice, CallKind::Video, CallKind::SilentVideo] {
            assert_eq!(Directive::parse(kind.token()), Directive::CallRequest(kind));
        }
    }
}
