pub mod client;
pub mod command;
pub mod response;
pub mod tls;

pub use client::*;
pub use command::*;
pub use response::*;

use std::fmt::Debug;
use tokio::io::{AsyncRead, AsyncWrite};

pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Debug + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Debug + Unpin + Send> AsyncReadAndWrite for T {}

pub type BoxedAsyncReadAndWrite = Box<dyn AsyncReadAndWrite>;
