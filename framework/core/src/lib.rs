mod abort;
mod action;
mod clock;
mod error;
mod name;
mod poll;

pub mod prelude {
    pub use crate::abort::{AbortHandle, AbortLevel, AbortListener};
    pub use crate::action::{ActionArgs, ActionBuilder, ActionEntry, ActionFn, BoundAction};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::error::{
        error_kind, AbortedError, ConfigurationError, ContextSetupError,
        GetResourceFailure, InvalidArgument, ResourceDescription, ResourceErrorStatus,
        ResourceNotFound, TimeoutError, ValidationError,
    };
    pub use crate::name::{ResourceNameGenerator, DEFAULT_RESOURCE_NAME_FORMAT};
    pub use crate::poll::{
        describe, get_from_manager, get_status, wait_for, wait_for_delete, PollError, Poller,
        Resource, ResourceManager, WaitConfig, WaitSpec, DEFAULT_ERROR_STATUSES, DEFAULT_ID_ATTR,
        DEFAULT_STATUS_ATTR,
    };
}
