//! Terminal renditions of the two application screens.

pub mod home;
pub mod login;

pub use home::HomeView;
pub use login::LoginView;
