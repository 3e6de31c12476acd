mod settings;

pub use settings::{
    CoreSettings, InstanceSettings, LoggingSettings, Settings, SubscriptionSettings,
};
