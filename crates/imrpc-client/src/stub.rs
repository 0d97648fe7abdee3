//! Typed client stubs.

/// Declares a typed stub for a remote service.
///
/// Each listed method becomes an async fn that serializes its argument,
/// calls the wire method name on the right of `=`, and decodes the result.
///
/// # Example
///
/// ```rust,no_run
/// use imrpc_client::{service, CallOptions, Client};
/// use serde::{Deserialize, Serialize};
/// use std::sync::Arc;
///
/// #[derive(Serialize, Deserialize)]
/// struct User {
///     id: u64,
///     name: String,
/// }
///
/// service! {
///     /// Client for the user service.
///     pub struct UserClient for "UserService" {
///         fn get_by_id(u64) -> User = "GetById";
///         fn rename(User) -> () = "Rename";
///     }
/// }
///
/// # async fn demo() -> imrpc_client::Result<()> {
/// let users = UserClient::new(Arc::new(Client::direct("127.0.0.1:8080")));
/// let user = users.get_by_id(&1, CallOptions::default()).await?;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! service {
    (
        $(#[$meta:meta])*
        $vis:vis struct $stub:ident for $service:literal {
            $(
                $(#[$method_meta:meta])*
                fn $method:ident($req:ty) -> $resp:ty = $wire:literal;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone)]
        $vis struct $stub {
            client: ::std::sync::Arc<$crate::Client>,
        }

        impl $stub {
            /// Service name on the wire.
            pub const SERVICE: &'static str = $service;

            pub fn new(client: ::std::sync::Arc<$crate::Client>) -> Self {
                Self { client }
            }

            pub fn client(&self) -> &$crate::Client {
                &self.client
            }

            $(
                $(#[$method_meta])*
                pub async fn $method(
                    &self,
                    req: &$req,
                    options: $crate::CallOptions,
                ) -> $crate::Result<$resp> {
                    self.client
                        .call::<$req, $resp>($service, $wire, req, options)
                        .await
                }
            )*
        }
    };
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use imrpc_common::transport::{write_frame, FrameTransport};
    use imrpc_common::{Request, Response, Serialization};
    use tokio::net::TcpListener;

    use crate::{CallOptions, Client};

    crate::service! {
        struct EchoClient for "Echo" {
            fn shout(String) -> String = "Shout";
        }
    }

    /// Replies to every request with `service.method:payload`.
    async fn naming_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let transport = FrameTransport::new();
            while let Ok(Some(frame)) = transport.read_frame(&mut stream).await {
                let request = Request::decode(&frame).unwrap();
                let payload: String = Serialization::Json.decode(&request.data).unwrap();
                let answer = format!("{}.{}:{}", request.service_name, request.method_name, payload);
                let response = Response::for_request(&request)
                    .with_data(Serialization::Json.encode(&answer).unwrap())
                    .finalize();
                if write_frame(&mut stream, &response.encode().unwrap()).await.is_err() {
                    return;
                }
            }
        });
        addr
    }

    #[test]
    fn test_stub_exposes_service_name() {
        assert_eq!(EchoClient::SERVICE, "Echo");
    }

    #[tokio::test]
    async fn test_stub_calls_wire_names() {
        let addr = naming_server().await;
        let stub = EchoClient::new(Arc::new(Client::direct(addr)));

        let answer = stub
            .shout(&"hi".to_string(), CallOptions::default())
            .await
            .unwrap();
        assert_eq!(answer, "Echo.Shout:hi");
    }
}
