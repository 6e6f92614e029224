use std::fmt;

/// A verification failure, reported at the call that first broke a rule
///
/// The emitter never recovers from one of these: partial verification results have no meaning, so
/// the first failure poisons the instance and every later call reports it. Callers fix the
/// offending call and rebuild, or discard the emitter.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    pub kind: ErrorKind,

    /// Index the offending instruction would have occupied in the stream
    pub instruction: usize,

    /// Rendered abstract stack at the failure, bottom of the stack first
    pub stack: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    /// A required argument was absent or empty
    ArgumentNull { param: &'static str },

    /// An opcode found fewer operands than it pops
    StackUnderflow { required: usize, have: usize },

    /// An operand was not assignable to what the opcode expects
    ///
    /// `position` counts from the top of the stack: position 0 is popped first.
    TypeMismatch {
        opcode: &'static str,
        position: usize,
        expected: String,
        actual: String,
    },

    /// Mis-nested or prematurely closed try/catch/finally
    ScopeError { reason: String, frame: String },

    /// Label misuse: double mark, unmarked at finalize, or branch-target stack disagreement
    LabelError { reason: String, label: String },

    /// No constructor of the type has exactly these parameter types
    NoSuchConstructor {
        type_name: String,
        parameters: Vec<String>,
    },

    /// No method of the type has this name and parameter list
    NoSuchMethod { type_name: String, method: String },

    /// Operation not valid in the current state (eg. mutation after finalize)
    InvalidOperation { reason: String },

    /// A label, local, or scope token belongs to a different emitter
    OwnershipError { token: String },
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::ArgumentNull { param } => {
                write!(formatter, "argument '{}' must not be empty", param)
            }
            ErrorKind::StackUnderflow { required, have } => write!(
                formatter,
                "stack underflow: {} operand(s) required but only {} on the stack",
                required, have
            ),
            ErrorKind::TypeMismatch {
                opcode,
                position,
                expected,
                actual,
            } => write!(
                formatter,
                "{}: operand at stack position {} should be {} but is {}",
                opcode, position, expected, actual
            ),
            ErrorKind::ScopeError { reason, frame } => {
                write!(formatter, "{} (in {})", reason, frame)
            }
            ErrorKind::LabelError { reason, label } => {
                write!(formatter, "{} (label {})", reason, label)
            }
            ErrorKind::NoSuchConstructor {
                type_name,
                parameters,
            } => write!(
                formatter,
                "{} has no constructor ({})",
                type_name,
                parameters.join(", ")
            ),
            ErrorKind::NoSuchMethod { type_name, method } => {
                write!(formatter, "{} has no method {}", type_name, method)
            }
            ErrorKind::InvalidOperation { reason } => formatter.write_str(reason),
            ErrorKind::OwnershipError { token } => write!(
                formatter,
                "{} was created by a different emitter",
                token
            ),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "{} (instruction #{}, stack [{}])",
            self.kind,
            self.instruction,
            self.stack.join(", ")
        )
    }
}

impl std::error::Error for Error {}
