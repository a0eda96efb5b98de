#![allow(clippy::enum_variant_names)]

pub mod parse {
    use std::error::Error;
    use std::fmt::Display;

    /// A class file whose bytes could not be decoded. Fatal for the
    /// operation that touched it.
    #[derive(Debug, Clone)]
    pub struct ParseError {
        pub class: String,
        pub msg: String,
    }

    impl ParseError {
        pub fn new(class: &str, msg: String) -> ParseError {
            ParseError {
                class: class.into(),
                msg,
            }
        }
    }

    impl Error for ParseError {}

    impl Display for ParseError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "failed to parse {}: {}", self.class, self.msg)
        }
    }

    /// Aggregated parse failures from a grouping batch; there is no
    /// partial result.
    #[derive(Debug)]
    pub struct GroupError {
        pub failures: Vec<ParseError>,
    }

    impl Error for GroupError {}

    impl Display for GroupError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            let rendered: Vec<String> = self
                .failures
                .iter()
                .map(|failure| failure.to_string())
                .collect();
            write!(f, "{}", rendered.join("; "))
        }
    }
}

pub mod rewrite {
    use std::error::Error;
    use std::fmt::Display;

    use jclass::errors::class_writing::WritingError;

    #[derive(Debug)]
    pub enum RewriteCause {
        /// A legacy offset store whose initialization sequence could not
        /// be anchored within the bounded lookback. Under-stripping is
        /// never acceptable, so this aborts the group.
        MissingAnchor(String),
        /// An expected instruction pattern was absent from a method the
        /// detector claimed matched.
        PatternNotFound(String),
        /// A removed field is still referenced outside the rewritten
        /// methods.
        DanglingFieldUse(String),
        Emit(String),
    }

    impl Display for RewriteCause {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                RewriteCause::MissingAnchor(what) => write!(f, "MissingAnchor: {what}"),
                RewriteCause::PatternNotFound(what) => write!(f, "PatternNotFound: {what}"),
                RewriteCause::DanglingFieldUse(what) => write!(f, "DanglingFieldUse: {what}"),
                RewriteCause::Emit(what) => write!(f, "Emit: {what}"),
            }
        }
    }

    #[derive(Debug)]
    pub struct RewriteError {
        cause: RewriteCause,
        msg: String,
    }

    impl RewriteError {
        pub fn new(cause: RewriteCause, msg: &str) -> RewriteError {
            RewriteError {
                cause,
                msg: msg.into(),
            }
        }
    }

    impl Error for RewriteError {}

    impl Display for RewriteError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "RewriteError: {}, {}", self.cause, self.msg)
        }
    }

    impl From<WritingError> for RewriteError {
        fn from(error: WritingError) -> Self {
            RewriteError::new(RewriteCause::Emit(error.to_string()), "")
        }
    }

    impl From<jclass::errors::class_loading::LoadingError> for RewriteError {
        fn from(error: jclass::errors::class_loading::LoadingError) -> Self {
            RewriteError::new(RewriteCause::Emit(error.to_string()), "reparse failed")
        }
    }
}
