//! 工具模块：日志与参数校验

pub mod logger;
pub mod validator;
