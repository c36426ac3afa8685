pub mod acceptance;
pub mod backoff;
pub mod error;
pub mod record;
pub mod run;
pub mod services;
pub mod settings;
pub mod store;
pub mod stream;

pub use error::{Error, Result};
pub use record::{Control, Item, Record, RecordKind, Request, Response, ResultRecord};
pub use run::RunSnapshot;
pub use settings::Settings;
pub use stream::{ResponderEntry, Stage, StageState, Stream};
